use serde_derive::{Serialize, Deserialize};

#[derive(Serialize, Deserialize)]
pub struct Execution(pub Vec<Command>);

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
#[derive(Clone, Debug)]
pub enum Command {
    /// Start the node with the given id
    Start {
        id: usize,
    },

    /// Start every configured node that is not running
    StartAll,

    /// Crash the specified node
    Crash {
        id: usize,
    },

    /// Bring a crashed node back with fresh state
    Restore {
        id: usize,
    },

    /// Sleep the test harness for `ms` milliseconds
    Sleep {
        ms: u64,
    },

    /// Ask the specified node to start a snapshot round
    Snapshot {
        id: usize,
    },

    /// Simulate a client authenticating against the specified node
    Authenticate {
        id: usize,
    },

    /// Print the view of every running node
    Status,
}
