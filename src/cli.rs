use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use crate::commands::{CompletionsCommand, ConfigureCommand, SignCommand, StreamCommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "telestream", version, about = "Stream AWS IoT telemetry over an authenticated MQTT WebSocket", long_about = None, arg_required_else_help = false)]
pub struct Cli {
    #[arg(
        short = 'p',
        long,
        global = true,
        default_value = "default",
        help = "Configuration profile name"
    )]
    pub profile: String,

    #[arg(short = 'v', long, global = true, action = ArgAction::Count, help = "Increase verbosity (-v info, -vv debug, -vvv trace)")]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Connect and print telemetry messages as JSON lines")]
    Stream(StreamCommand),
    #[command(about = "Print a presigned WebSocket URL for the configured endpoint")]
    Sign(SignCommand),
    #[command(about = "Configure Cognito and AWS IoT settings")]
    Configure(ConfigureCommand),
    #[command(about = "Generate shell completion scripts for telestream")]
    Completions(CompletionsCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let profile = self.profile;
        let command = self
            .command
            .unwrap_or(Commands::Stream(StreamCommand::default()));

        match command {
            Commands::Stream(cmd) => cmd.execute(&profile).await,
            Commands::Sign(cmd) => cmd.execute(&profile).await,
            Commands::Configure(cmd) => cmd.execute(&profile).await,
            Commands::Completions(cmd) => {
                cmd.execute();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, error::ErrorKind};

    #[test]
    fn test_default_command_is_stream() {
        let cli = Cli {
            profile: "default".to_string(),
            verbose: 0,
            command: None,
        };

        match cli
            .command
            .unwrap_or(Commands::Stream(StreamCommand::default()))
        {
            Commands::Stream(cmd) => {
                assert_eq!(cmd.topic, None);
                assert!(!cmd.pretty);
            }
            _ => panic!("Expected Stream command as default"),
        }
    }

    #[test]
    fn test_profile_default_value() {
        let cli = Cli::try_parse_from(["telestream", "stream"]).unwrap();
        assert_eq!(cli.profile, "default");
    }

    #[test]
    fn test_profile_custom_value() {
        let cli = Cli::try_parse_from(["telestream", "--profile", "plant", "stream"]).unwrap();
        assert_eq!(cli.profile, "plant");
    }

    #[test]
    fn test_profile_short_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["telestream", "sign", "-p", "dev"]).unwrap();
        assert_eq!(cli.profile, "dev");
    }

    #[test]
    fn test_stream_with_topic_override() {
        let cli =
            Cli::try_parse_from(["telestream", "stream", "--topic", "plant/line2/#", "--pretty"])
                .unwrap();
        match cli.command {
            Some(Commands::Stream(cmd)) => {
                assert_eq!(cmd.topic.as_deref(), Some("plant/line2/#"));
                assert!(cmd.pretty);
            }
            _ => panic!("Expected Stream command"),
        }
    }

    #[test]
    fn test_stream_topic_short_flag() {
        let cli = Cli::try_parse_from(["telestream", "stream", "-t", "a/b"]).unwrap();
        match cli.command {
            Some(Commands::Stream(cmd)) => assert_eq!(cmd.topic.as_deref(), Some("a/b")),
            _ => panic!("Expected Stream command"),
        }
    }

    #[test]
    fn test_sign_command_parsing() {
        let cli = Cli::try_parse_from(["telestream", "sign"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Sign(_))));
    }

    #[test]
    fn test_configure_command_parsing() {
        let cli = Cli::try_parse_from(["telestream", "configure"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Configure(_))));
    }

    #[test]
    fn test_completions_command_parsing() {
        let cli = Cli::try_parse_from(["telestream", "completions", "bash"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Completions(_))));
    }

    #[test]
    fn test_no_command_defaults_to_stream() {
        let cli = Cli::try_parse_from(["telestream"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_command_structure_validation() {
        let cmd = Cli::command();
        cmd.debug_assert();
    }

    #[test]
    fn test_invalid_command_fails() {
        let result = Cli::try_parse_from(["telestream", "invalid"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_help_flag_works() {
        let result = Cli::try_parse_from(["telestream", "--help"]);
        assert!(result.is_err());
        if let Err(e) = result {
            assert_eq!(e.kind(), ErrorKind::DisplayHelp);
        }
    }

    #[test]
    fn test_version_flag_works() {
        let result = Cli::try_parse_from(["telestream", "--version"]);
        assert!(result.is_err());
        if let Err(e) = result {
            assert_eq!(e.kind(), ErrorKind::DisplayVersion);
        }
    }

    #[test]
    fn test_verbose_flag_multiple() {
        let cli = Cli::try_parse_from(["telestream", "-vvv", "stream"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn test_verbose_long_flag() {
        let cli = Cli::try_parse_from(["telestream", "--verbose", "--verbose", "stream"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_verbose_default_zero() {
        let cli = Cli::try_parse_from(["telestream", "stream"]).unwrap();
        assert_eq!(cli.verbose, 0);
    }
}
