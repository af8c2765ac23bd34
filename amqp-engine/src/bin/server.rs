//! AMQP 1.0 server serving in-memory queues.
//!
//! Any address a client attaches to gets a queue on demand. Queues created
//! that way disappear once they are empty and no link uses them.
//!
//! # Usage
//!
//! ```sh
//! amqp-engine-server --bind 0.0.0.0:5672 --prefetch 128
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use amqp_engine::protocol::MIN_MAX_FRAME_SIZE;
use amqp_engine::{QueueRegistry, Server, ServerConfig, ServerError, init_tracing};

/// Default bind address.
const DEFAULT_BIND: &str = "0.0.0.0:5672";

fn main() {
    if let Err(e) = run() {
        eprintln!("amqp-engine-server: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), ServerError> {
    let args: Vec<String> = std::env::args().collect();
    let Some(config) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };
    init_tracing();

    eprintln!(
        "amqp-engine-server: starting on {} as {}",
        config.bind_addr, config.connection.container_id
    );
    let server = Server::spawn(config, Arc::new(QueueRegistry::with_auto_create()))?;
    eprintln!("amqp-engine-server: listening on {}", server.local_addr());

    // Runs until the process is killed or something sets the flag.
    let shutdown_flag = server.shutdown_flag();
    while !shutdown_flag.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    eprintln!("amqp-engine-server: shutting down...");
    server.shutdown();
    eprintln!("amqp-engine-server: stopped");
    Ok(())
}

/// Parses the command line. `None` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<ServerConfig>, ServerError> {
    let mut config = ServerConfig::default();
    let mut bind_addr: Option<SocketAddr> = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        if matches!(flag, "--help" | "-h") {
            return Ok(None);
        }
        i += 1;
        let value = args
            .get(i)
            .ok_or_else(|| ServerError::InvalidArgument(format!("missing value for {flag}")))?;
        match flag {
            "--bind" | "-b" => bind_addr = Some(parse(flag, value)?),
            "--prefetch" | "-p" => config.connection.prefetch = parse(flag, value)?,
            "--max-frame-size" | "-f" => {
                let size: u32 = parse(flag, value)?;
                if size < MIN_MAX_FRAME_SIZE {
                    return Err(ServerError::InvalidArgument(format!(
                        "--max-frame-size must be at least {MIN_MAX_FRAME_SIZE}"
                    )));
                }
                config.connection.max_frame_size = size;
            }
            "--container-id" | "-c" => config.connection.container_id.clone_from(value),
            _ => {
                return Err(ServerError::InvalidArgument(format!(
                    "unknown argument: {flag}"
                )));
            }
        }
        i += 1;
    }

    config.bind_addr = match bind_addr {
        Some(addr) => addr,
        None => parse("--bind", DEFAULT_BIND)?,
    };
    Ok(Some(config))
}

fn parse<T>(flag: &str, value: &str) -> Result<T, ServerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ServerError::InvalidArgument(format!("{flag} {value}: {e}")))
}

fn print_usage() {
    eprintln!(
        r#"amqp-engine-server - AMQP 1.0 server with in-memory queues

USAGE:
    amqp-engine-server [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>            Bind address (default: 0.0.0.0:5672)
    -p, --prefetch <N>           Credit window per receiving link (default: 64)
    -f, --max-frame-size <BYTES> Largest accepted frame, at least 512 (default: 65536)
    -c, --container-id <ID>      Container id sent in open (default: random)
    -h, --help                   Print this help message

ENVIRONMENT:
    RUST_LOG                     Log filter when built with --features tracing

EXAMPLE:
    amqp-engine-server --bind 127.0.0.1:5672 --prefetch 256
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("amqp-engine-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_bind_the_standard_port() {
        let config = parse_args(&args(&[])).unwrap().unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND.parse::<SocketAddr>().unwrap());
        assert_eq!(config.connection.prefetch, 64);
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse_args(&args(&[
            "--bind",
            "127.0.0.1:9000",
            "-p",
            "8",
            "--max-frame-size",
            "4096",
            "--container-id",
            "broker-1",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.connection.prefetch, 8);
        assert_eq!(config.connection.max_frame_size, 4096);
        assert_eq!(config.connection.container_id, "broker-1");
    }

    #[test]
    fn bad_input_is_rejected() {
        for bad in [
            &["--bind"][..],
            &["--bind", "nowhere"],
            &["--prefetch", "-1"],
            &["--max-frame-size", "100"],
            &["--verbose", "1"],
        ] {
            assert!(
                matches!(parse_args(&args(bad)), Err(ServerError::InvalidArgument(_))),
                "{bad:?}"
            );
        }
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
    }
}
