//! Address ranges and range pools for virtual networks.
//!
//! An [`AddressRange`] is a contiguous block of link-layer and IP addresses
//! that leases individual addresses to owners (VMs, networks, virtual
//! routers). A [`RangePool`] holds the ranges of one network and routes
//! requests to them. Ranges whose definition names an `IPAM_MAD` delegate
//! address selection to an external plugin through [`vnet_ipam`].
//!
//! ```ignore
//! let mut pool = RangePool::new(RangeContext::new(RangeConfig::load()?)?);
//! let ar_id = pool.add_range(&definition).await?;
//!
//! let mut lease = Template::new();
//! pool.allocate(&AddressTarget::Next, Owner::vm(42), &mut lease, None, FreeCheck::Strict)
//!     .await?;
//! println!("leased {}", lease.get("IP").unwrap_or("-"));
//! ```

pub mod address_type;
pub mod allocation;
pub mod audit;
pub mod config;
pub mod error;
pub mod owner;
pub mod pool;
pub mod range;

pub use address_type::AddressType;
pub use allocation::AllocationIndex;
pub use audit::{init_logging, AuditCategory, AuditOutcome, AuditRecord};
pub use config::{RangeConfig, RangeContext, DEFAULT_CONFIG_PATH};
pub use error::{ErrorClass, RangeError, RangeResult};
pub use owner::{Owner, OwnerKind};
pub use pool::RangePool;
pub use range::{AddressRange, AddressTarget, FreeCheck, LeaseInfo, PortBlock, UpdateReport};
