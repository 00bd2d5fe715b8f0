pub mod client;
pub mod endpoint;
pub mod launch;
pub mod listener;
pub mod metrics;
pub mod port_rewrite;
pub mod process;
pub mod protocols;

// Re-export the pieces tests reach for
pub use client::{
    ClientError, Item, LeaseItem, LeaseSetOutcome, McClient, Reply, StoreOptions,
    MAX_PAYLOAD_LEN, REPLICATE_FLAG,
};
pub use endpoint::Endpoint;
pub use launch::{MockServerBuilder, ProxyBuilder};
pub use listener::ListenSocket;
pub use metrics::{CountersSnapshot, OperationCounters};
pub use port_rewrite::{
    replace_ports, replace_strings, rewrite, scan_ports, PortMap, PortRewrite, PortTargets,
    RewriteError,
};
pub use process::{
    LaunchOptions, ManagedProcess, ProcessControl, ProcessDump, ProcessError, ProcessKind,
    Termination,
};
pub use protocols::{AsciiCommand, AsciiResponse, ProtocolError, StoreMode};
