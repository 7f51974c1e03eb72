use clap::{Parser, Subcommand};

/// datagate: scoped read/write gateway over the ticket dataset
#[derive(Parser)]
#[command(name = "datagate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (defaults to DATAGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply pending database migrations and exit
    Migrate,

    /// Print an argon2 hash for seeding admin_users by hand
    HashPassword {
        /// Password to hash. Read from stdin when omitted.
        #[arg(long, env = "DATAGATE_ADMIN_PASSWORD")]
        password: Option<String>,
    },
}
