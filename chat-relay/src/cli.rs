use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_ADDR: &str = "127.0.0.1:7000";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting chat clients over TCP.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = DEFAULT_ADDR)]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name sent in the hello. Prompted for when omitted.
    #[arg(long)]
    pub name: Option<String>,

    /// Address of the relay to connect to.
    #[arg(long, env = "CHAT_RELAY_SERVER", default_value = DEFAULT_ADDR)]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_to_fixed_address() {
        let cli = Cli::try_parse_from(["chat-relay", "server"]).unwrap();
        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.listen, DEFAULT_ADDR.parse::<SocketAddr>().unwrap());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn client_name_is_optional() {
        let cli = Cli::try_parse_from(["chat-relay", "client", "--server", "127.0.0.1:9000"])
            .unwrap();
        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.name, None);
                assert_eq!(args.server, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
