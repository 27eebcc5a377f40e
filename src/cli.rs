use clap::{Parser, Subcommand};

/// StudyMate inbox: notifications from the terminal
#[derive(Parser)]
#[command(name = "studymate", version, about)]
pub struct Cli {
    /// Signed-in user whose inbox to open
    #[arg(short, long, global = true, env = "STUDYMATE_USER_ID")]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the inbox once
    List {
        /// Emit the feed snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Follow the inbox, printing it on every change
    Watch,

    /// Print the unread badge count
    Unread,

    /// Mark one notification as read
    Read {
        #[arg(long)]
        id: String,
    },

    /// Mark every unread notification as read
    ReadAll,
}
