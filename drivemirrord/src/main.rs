use drivemirrord::daemon::{DaemonConfig, DaemonRuntime, erase_checkpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Erase,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--erase" => mode = CliMode::Erase,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Erase => {
            let config = DaemonConfig::from_env()?;
            erase_checkpoint(&config).await?;
            eprintln!("[drivemirrord] checkpoint erased");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: drivemirrord [--erase]");
            println!("  --erase   Remove the persisted sync checkpoint and exit");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let runtime = DaemonRuntime::bootstrap(config).await?;
    runtime.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["drivemirrord".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_erase() {
        let mode = parse_cli_mode(vec!["drivemirrord".to_string(), "--erase".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Erase);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_arguments() {
        assert!(parse_cli_mode(vec!["drivemirrord".to_string(), "--bogus".to_string()]).is_err());
    }
}
