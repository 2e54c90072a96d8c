use std::error::Error;
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use crossterm::tty::IsTty;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use rchat::terminal::DiagnosticWriter;
use rchat::{CrlfWriter, EndpointOptions, RawModeGuard, SessionEndpoint, SessionError, Termination, DEFAULT_PORT};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,

    /// Don't print status messages
    #[arg(short, long, global = true)]
    silent: bool,

    /// Don't show what you type
    #[arg(long, global = true)]
    no_echo: bool,

    /// Print diagnostics (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for one client and chat with it
    Server {
        #[arg(short, long, default_value_t = DEFAULT_PORT, value_parser = port_in_range)]
        port: u16,

        /// Interface to listen on
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,
    },

    /// Connect to a server and chat with it
    Client {
        /// IP address of the server
        address: String,

        #[arg(short, long, default_value_t = DEFAULT_PORT, value_parser = port_in_range)]
        port: u16,
    },
}

fn port_in_range(s: &str) -> Result<u16, String> {
    let port: u16 = u16::from_str_radix(s, 10)
        .map_err(|_| format!("{} is not a valid port number", s))?;

    // port is a u16 value. Only 0 is an invalid port
    if port == 0 {
        Err(format!("{} is not a valid port number", s))
    } else {
        Ok(port)
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(DiagnosticWriter::stderr)
        .with_target(false)
        .init();
}

/// Print an error with its whole chain of causes
fn report(error: &SessionError) {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(&format!(": {}", cause));
        source = cause.source();
    }

    if error.is_setup() {
        eprintln!("{}", message.red());
    } else {
        eprintln!("{}", format!("session failed: {}", message).red());
    }
}

async fn chat(cli: &Cli) -> Result<(), SessionError> {
    let mut options = EndpointOptions {
        silent: cli.silent,
        echo: !cli.no_echo,
        ..EndpointOptions::default()
    };

    let mut endpoint = match &cli.commands {
        Commands::Server { port, bind } => {
            options.bind_host = *bind;
            let mut endpoint = SessionEndpoint::new(options);
            endpoint.accept_as_listener(*port).await?;
            endpoint
        }
        Commands::Client { address, port } => {
            let mut endpoint = SessionEndpoint::new(options);
            endpoint.dial_as_initiator(address, *port).await?;
            endpoint
        }
    };

    if !cli.silent {
        eprintln!("\nType messages to send, {} to exit", "Ctrl-C".bold());
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;

        for signum in [SignalKind::terminate(), SignalKind::hangup()] {
            tokio::spawn(async move {
                if let Err(e) = rchat::terminal::end_on_signal(signum).await {
                    tracing::warn!(error = %e, "signal handler not installed");
                }
            });
        }
    }

    let termination = {
        let raw = RawModeGuard::acquire()?;

        let stdout = tokio::io::stdout();
        let display = if raw.is_active() && std::io::stdout().is_tty() {
            CrlfWriter::new(stdout)
        } else {
            CrlfWriter::passthrough(stdout)
        };

        endpoint.run(tokio::io::stdin(), Arc::new(Mutex::new(display))).await?
        // raw mode is restored here
    };

    if !cli.silent {
        eprintln!();
        match &termination {
            Termination::ReadFailed(_) | Termination::InputFailed(_) => eprintln!("{}", termination.to_string().red()),
            _ if termination.is_remote() => eprintln!("{}", termination.to_string().yellow()),
            _ => eprintln!("{}", termination.to_string().blue()),
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}", format!("Failed to start runtime: {}", e).red());
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(chat(&cli));

    // A stdin read still blocked on its thread cannot be interrupted
    runtime.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report(&error);
            ExitCode::FAILURE
        }
    }
}
