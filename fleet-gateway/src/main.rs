#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

use anyhow::Context as _;
use fleet_gateway::config::ConfHandle;
use fleet_gateway::service::GatewayService;

enum CliAction {
    ShowHelp,
    Run,
    ConfigInitOnly,
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let executable = args.next().context("executable name is missing from the environment")?;

    // Extract and remove --config-path argument if provided
    let mut config_path = None;
    let mut remaining_args = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            if let Some(path) = args.next() {
                config_path = Some(path);
            } else {
                anyhow::bail!("missing value for --config-path");
            }
        } else {
            remaining_args.push(arg);
        }
    }

    if let Some(path) = config_path {
        // SAFETY: At this point the program is single-threaded.
        unsafe { std::env::set_var("FGATEWAY_CONFIG_PATH", &path) };
    }

    let action = match remaining_args.first().map(String::as_str) {
        None => CliAction::Run,
        Some("--config-init-only") => CliAction::ConfigInitOnly,
        Some(_) => CliAction::ShowHelp,
    };

    match action {
        CliAction::ShowHelp => {
            println!(
                r#"HELP:

    Run:
        "{executable}"

    Initialize configuration only (will not override existing configuration):
        "{executable}" --config-init-only

    Use an alternative configuration directory:
        "{executable}" --config-path <DIR>
"#
            );
        }
        CliAction::ConfigInitOnly => {
            ConfHandle::init().context("failed to initialize configuration")?;
            println!("Configuration initialized");
        }
        CliAction::Run => {
            let conf_handle = ConfHandle::init().context("failed to initialize configuration")?;

            let mut service = GatewayService::load(conf_handle).context("service loading failed")?;

            service.start().context("service startup failed")?;
            service.run_until_ctrl_c()?;
            service.stop();
        }
    }

    Ok(())
}
