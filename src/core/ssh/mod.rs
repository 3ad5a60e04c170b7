mod client;

pub use client::{SshClient, SshSession, SshTransport};
