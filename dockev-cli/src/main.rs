use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dockev_cli::DockevCliArgs;
use dockev_cli::HostConfig;
use dockev_cli::Shell;
use dockev_cli::TerminalPrompt;
use dockev_cli::build_manager;
use dockev_cli::cli_args;
use dockev_cli::config;
use dockev_cli::logging;
use dockev_cli::prompt;
use dockev_cli::scaffold::scaffold;
use dockev_security::AutoDeny;
use dockev_security::DecisionProvider;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let args = DockevCliArgs::parse();
    cli_args::validate(&args)?;

    let config_path = args
        .config_path
        .clone()
        .or_else(config::default_config_path);
    let mut config = match &config_path {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    args.apply_to(&mut config);

    let _log_guard = logging::init(args.verbose, config.log_dir.as_deref())?;
    info!(
        plugin_root = %config.plugin_root.display(),
        unattended = config.unattended,
        "starting dockev"
    );

    if !args.no_scaffold {
        scaffold(&config.plugin_root)?;
    }

    let input = prompt::spawn_line_reader(BufReader::new(std::io::stdin()));
    let provider: Arc<dyn DecisionProvider> = if config.unattended {
        Arc::new(AutoDeny)
    } else {
        Arc::new(TerminalPrompt::stdout(input.clone()))
    };
    let mut shell = Shell::new(
        build_manager(&config, provider),
        config.prompt.clone(),
        Box::new(std::io::stdout()),
    );
    if let Err(err) = shell.start() {
        shell.shutdown();
        return Err(err);
    }

    if args.commands.is_empty() {
        let poll = (config.poll_interval_ms > 0)
            .then(|| Duration::from_millis(config.poll_interval_ms));
        shell.run(&input, poll);
    } else {
        shell.run_script(&args.commands);
    }
    shell.shutdown();
    Ok(())
}
