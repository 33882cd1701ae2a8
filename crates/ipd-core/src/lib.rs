// ipd-core: Pure types, config, records, utilities
// No internal ipd dependencies — this is the foundation crate.

pub mod buildspec;
pub mod config;
pub mod logging;
pub mod naming;
pub mod record;
pub mod sshkey;
pub mod userdata;
