use memosyncd::config::DaemonConfig;
use memosyncd::daemon::DaemonRuntime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn format_millis(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|time| time.format(&Rfc3339).ok())
        .unwrap_or_else(|| millis.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("memosyncd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: memosyncd [--once | --status]");
        println!("  --once     Run a single sync pass and exit");
        println!("  --status   Show pending local changes and the last sync time");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => {
            let report = daemon.sync_once().await?;
            println!(
                "downloaded={} overwritten={} deleted_local={} uploaded={} deleted_remote={} skipped={} rejected={}",
                report.downloaded,
                report.overwritten,
                report.deleted_local,
                report.uploaded,
                report.deleted_remote,
                report.skipped,
                report.rejected
            );
            Ok(())
        }
        CliMode::Status => {
            let status = daemon.status().await?;
            match status.last_sync_time {
                Some(millis) => println!("last sync: {}", format_millis(millis)),
                None => println!("last sync: never"),
            }
            println!("pending changes: {}", status.pending.len());
            for item in &status.pending {
                println!("  {} {}", item.status.as_code(), item.key);
            }
            Ok(())
        }
        CliMode::Run | CliMode::Help => daemon.run().await,
    }
}
