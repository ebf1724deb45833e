use std::net::{Ipv4Addr, SocketAddr};

use clap::{Args, Parser, Subcommand};

use crate::wire::is_valid_name;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the registry server, accepting control connections.
    Server(ServerArgs),
    /// Join the chat through a registry server.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the registry should listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub listen: SocketAddr,

    /// Local UDP address used to push join/exit announcements.
    #[arg(long, default_value = "0.0.0.0:0")]
    pub announce_bind: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Screen name to register; no spaces or ':'.
    #[arg(long, value_parser = parse_screen_name)]
    pub name: String,

    /// Address of the registry server.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub server: SocketAddr,

    /// Local IPv4 address peers should send chat datagrams to.
    #[arg(long, default_value = "127.0.0.1")]
    pub advertise_ip: Ipv4Addr,
}

fn parse_screen_name(name: &str) -> Result<String, String> {
    if is_valid_name(name) {
        Ok(name.to_string())
    } else {
        Err("screen names must be non-empty and contain no whitespace or ':'".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults_to_local_registry() {
        let cli = Cli::try_parse_from(["chat_relay", "client", "--name", "alice"]).unwrap();
        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.name, "alice");
                assert_eq!(args.server, "127.0.0.1:7000".parse().unwrap());
                assert_eq!(args.advertise_ip, Ipv4Addr::LOCALHOST);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_names_that_break_framing() {
        for name in ["al ice", "al:ice", ""] {
            assert!(
                Cli::try_parse_from(["chat_relay", "client", "--name", name]).is_err(),
                "{name:?} should be rejected"
            );
        }
    }
}
