//! AutoDeploy - 部署编排代理
//!
//! Usage:
//! - Normal mode: `autodeploy`
//! - With custom port: `autodeploy --port 19999`
//! - Custom project file: `autodeploy --projects ./projects.json --data-dir ./data`

use std::path::PathBuf;

use autodeploy::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--projects" if i + 1 < args.len() => {
                config.projects_file = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--data-dir" if i + 1 < args.len() => {
                config.data_dir = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("AutoDeploy - 部署编排代理");
    println!();
    println!("USAGE:");
    println!("    autodeploy [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>         Override the listening port");
    println!("    --projects <FILE>     Project configuration file");
    println!("    --data-dir <DIR>      Data directory (history)");
    println!("    -h, --help            Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    AUTODEPLOY_API_KEY, PORT, AUTODEPLOY_DATA_DIR, AUTODEPLOY_PROJECTS_FILE,");
    println!("    PROMPT_IDLE_MS, PROMPT_TIMEOUT_SECS, STOP_GRACE_MS, RUN_TIMEOUT_SECS,");
    println!("    FANOUT_MODE, HISTORY_LIMIT, RUST_LOG");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args();
    autodeploy::run_with_config(config).await
}
