//! Command line interface for the `amqpframe` broker binary.
//!
//! Shared with `build.rs`, which renders the man page from it, so this
//! module only depends on `clap` and `std`.

use std::net::SocketAddr;

use clap::{Parser, ValueEnum};

/// Disposition settlement policy selectable from the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Settle {
    /// Each disposition settles the oldest outstanding delivery.
    #[default]
    Fifo,
    /// Each disposition settles the deliveries in its id range.
    Range,
}

/// Command line arguments for the `amqpframe` binary.
#[derive(Debug, Parser)]
#[command(
    name = "amqpframe",
    version,
    about = "In-memory message broker speaking the amqpframe wire protocol"
)]
pub struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:5672")]
    pub bind: SocketAddr,

    /// Container identifier advertised in `Open`.
    #[arg(long, default_value = "amqpframe")]
    pub container_id: String,

    /// Largest frame accepted from peers, in bytes.
    #[arg(long, default_value_t = 65_536)]
    pub max_frame_size: u32,

    /// Credit granted to each publishing peer.
    #[arg(long, default_value_t = 100)]
    pub publish_credit: u32,

    /// How inbound dispositions select deliveries.
    #[arg(long, value_enum, default_value_t)]
    pub settle: Settle,

    /// Accept `user:password` through SASL PLAIN; repeatable. Without any
    /// user peers authenticate anonymously.
    #[arg(long = "user", value_name = "USER:PASSWORD")]
    pub users: Vec<String>,

    /// Queue to create at startup; repeatable.
    #[arg(short, long = "queue", value_name = "ADDRESS")]
    pub queues: Vec<String>,

    /// Create queues on first attach.
    #[arg(long)]
    pub auto_create: bool,

    /// Number of accept workers; defaults to the number of CPUs.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics: Option<SocketAddr>,
}

impl Cli {
    /// Split the `--user` values into `(user, password)` pairs.
    ///
    /// Values without a colon are skipped and returned in the second list.
    #[must_use]
    pub fn credentials(&self) -> (Vec<(String, String)>, Vec<String>) {
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for entry in &self.users {
            match entry.split_once(':') {
                Some((user, password)) => valid.push((user.to_owned(), password.to_owned())),
                None => invalid.push(entry.clone()),
            }
        }
        (valid, invalid)
    }
}
