//! `config`: inspect the config file and store credentials.

use secrecy::SecretString;
use tracing::info;

use ontap_config as config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&config::config_path().display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = config::load_config_or_default().redacted();
            let rendered = output::render_single(global.output, &cfg, |c| {
                toml::to_string_pretty(c).unwrap_or_else(|e| format!("cannot render config: {e}"))
            });
            output::print_output(&rendered, global.quiet);
            Ok(())
        }

        ConfigCommand::SetPassword => {
            let cfg = config::load_config()?;
            let Some((name, _)) = cfg.profile(global.profile.as_deref())? else {
                return Err(CliError::Validation {
                    field: "profile".into(),
                    reason: "no profile selected; pass --profile or set default_profile".into(),
                });
            };
            let password = rpassword::prompt_password(format!("Password for profile '{name}': "))?;
            if password.is_empty() {
                return Err(CliError::Validation {
                    field: "password".into(),
                    reason: "must not be empty".into(),
                });
            }
            config::store_password(&name, &SecretString::from(password))?;
            info!(profile = %name, "password stored in keyring");
            if !global.quiet {
                eprintln!("Password stored for profile '{name}'");
            }
            Ok(())
        }
    }
}
