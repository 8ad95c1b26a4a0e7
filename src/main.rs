use std::path::PathBuf;
use std::sync::Arc;

use nowcast_coordinator::api::server::serve;
use nowcast_coordinator::pipeline::catalog::{FanOut, StageCatalog};
use nowcast_coordinator::pipeline::checklist_store::FileChecklistStore;
use nowcast_coordinator::pipeline::coordinator::RunCoordinator;
use nowcast_coordinator::pipeline::notify::{LogNotifier, SharedNotifier, WebhookNotifier};
use nowcast_coordinator::pipeline::service::CoordinatorService;
use nowcast_coordinator::pipeline::settings_layer::{
    load_coordinator_settings, load_settings_file, overlay_from_env, resolve_settings,
    CoordinatorSettings,
};
use nowcast_coordinator::worker::transport::{
    HttpLaunchTransport, LogLaunchTransport, SharedLaunchTransport,
};
use serde_json::json;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    if matches!(cli_args.first().map(String::as_str), Some("validate-catalog")) {
        run_validate_catalog_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>())?;
        return Ok(());
    }

    let serve_args = parse_serve_cli_args(cli_args.as_slice())?;
    let settings = load_coordinator_settings(
        serve_args.app_root.as_path(),
        serve_args.settings_path.as_deref(),
    )?;
    // The blocking HTTP clients must be built off the async runtime.
    let service_settings = settings.clone();
    let service = tokio::task::spawn_blocking(move || build_service(&service_settings))
        .await?
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    service.resume().await?;

    serve(settings.bind, service).await?;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

fn default_app_root() -> PathBuf {
    std::env::var("NOWCAST_APP_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn build_service(
    settings: &CoordinatorSettings,
) -> Result<CoordinatorService, Box<dyn std::error::Error + Send + Sync>> {
    let catalog = Arc::new(StageCatalog::load_file(settings.catalog_path.as_path())?);
    info!(
        catalog = %settings.catalog_path.display(),
        stages = catalog.stages().len(),
        digest = %catalog.digest(),
        "loaded stage catalog"
    );

    let store = Arc::new(FileChecklistStore::new(settings.state_dir.clone()));
    let notifier: SharedNotifier = match settings.alert_webhook_url.clone() {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };
    let transport: SharedLaunchTransport = match settings.launch_endpoint.clone() {
        Some(url) => Arc::new(HttpLaunchTransport::new(url)?),
        None => Arc::new(LogLaunchTransport),
    };

    let coordinator = Arc::new(RunCoordinator::new(catalog, store, notifier));
    Ok(CoordinatorService::new(coordinator, transport))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServeCliArgs {
    app_root: PathBuf,
    settings_path: Option<String>,
}

fn parse_serve_cli_args(args: &[String]) -> Result<ServeCliArgs, Box<dyn std::error::Error>> {
    let mut app_root = default_app_root();
    let mut settings_path = None::<String>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                app_root = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            "--settings" => {
                settings_path = Some(needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUsage: nowcast-coordinator [--app-root PATH] [--settings PATH]\n       nowcast-coordinator validate-catalog [--catalog PATH]"
                ))
                .into());
            }
        }
    }
    Ok(ServeCliArgs {
        app_root,
        settings_path,
    })
}

fn run_validate_catalog_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        println!("Usage: nowcast-coordinator validate-catalog [--catalog PATH] [--app-root PATH]");
        return Ok(());
    }

    let mut app_root = default_app_root();
    let mut catalog_path = None::<PathBuf>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--catalog" => {
                catalog_path = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--app-root" => {
                app_root = PathBuf::from(needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    let catalog_path = match catalog_path {
        Some(path) if path.is_absolute() => path,
        Some(path) => app_root.join(path),
        None => {
            let file = load_settings_file(app_root.as_path(), None)?;
            resolve_settings(&file, &overlay_from_env(), app_root.as_path())?.catalog_path
        }
    };

    let catalog = StageCatalog::load_file(catalog_path.as_path())?;
    let stages = catalog
        .stages()
        .iter()
        .map(|stage| {
            let fan_out = match &stage.fan_out {
                Some(FanOut::Payload { stage, field }) => json!(format!("{stage}.{field}")),
                Some(FanOut::Static { items }) => json!(items),
                None => serde_json::Value::Null,
            };
            json!({
                "name": stage.name,
                "worker": stage.worker,
                "predecessors": stage.predecessors,
                "run_types": stage.run_types,
                "critical": stage.critical,
                "max_retries": stage.max_retries,
                "timeout_secs": stage.timeout_secs,
                "produces": stage.produces,
                "fan_out": fan_out,
            })
        })
        .collect::<Vec<_>>();
    let summary = json!({
        "ok": true,
        "catalog_path": catalog_path.display().to_string(),
        "digest": catalog.digest(),
        "run_types": catalog.run_types(),
        "stage_count": stages.len(),
        "stages": stages,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_flags() {
        let args = vec![
            String::from("--app-root"),
            String::from("/srv/nowcast"),
            String::from("--settings"),
            String::from("config/prod.toml"),
        ];
        let parsed = parse_serve_cli_args(args.as_slice()).expect("args should parse");
        assert_eq!(parsed.app_root, PathBuf::from("/srv/nowcast"));
        assert_eq!(parsed.settings_path.as_deref(), Some("config/prod.toml"));
    }

    #[test]
    fn rejects_unknown_or_incomplete_flags() {
        assert!(parse_serve_cli_args(&[String::from("--verbose")]).is_err());
        assert!(parse_serve_cli_args(&[String::from("--settings")]).is_err());
    }
}
