use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Config {
    #[clap(subcommand)]
    pub role: Role,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// run the rendezvous registry peers find each other through
    Registry {
        /// address to listen on
        #[clap(short, long, value_parser, default_value = "0.0.0.0:9090")]
        listen: String,
    },
    /// join a swarm, download what is missing, seed what is owned
    Peer {
        /// metainfo (.shoal) file describing the share
        #[clap(short, long, value_parser)]
        metainfo: String,
        /// address other peers reach this node at
        #[clap(short, long, value_parser)]
        listen: String,
        /// directory the chunk files live in
        #[clap(short, long, value_parser, default_value = "chunks")]
        pieces_dir: String,
        /// hold the download until this many peers are known
        #[clap(long, value_parser, default_value_t = 1)]
        min_peers: usize,
        /// write the reassembled file here once complete
        #[clap(short, long, value_parser)]
        output: Option<String>,
    },
    /// split a file into chunk files and write its metainfo
    Chunk {
        /// file to share
        #[clap(short, long, value_parser)]
        file: String,
        /// directory to write the chunk files into
        #[clap(short, long, value_parser, default_value = "chunks")]
        pieces_dir: String,
        /// registry address to embed in the metainfo
        #[clap(short, long, value_parser)]
        registry: String,
        /// metainfo output path, defaults to `<name>.shoal`
        #[clap(short, long, value_parser)]
        out: Option<String>,
    },
}

impl Config {
    pub fn new() -> Config {
        Config::parse()
    }
}
