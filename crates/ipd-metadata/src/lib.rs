// ipd-metadata: the instance-metadata rendezvous service.
//
// Guests contact this service during first boot (through the
// hypervisor-local redirector that injects the identity headers), fetch
// their hostname, SSH key, and cloud-init user-data, and phone home with
// their acquired address and host keys. The phone-home write is the
// signal the build scheduler blocks on.

pub mod manager;
pub mod server;

pub use manager::{MetadataError, MetadataManager};
pub use server::{AppState, router};
