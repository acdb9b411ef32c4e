//! sluice-services — leaf services behind the command processor: the
//! watering schedule store, Wi-Fi station management, and the solenoid bank.
//!
//! Each service implements [`CommandService`] and is registered with the
//! processor under its opcode. Hardware access (GPIO, the Wi-Fi supplicant)
//! sits behind driver traits so the daemon and the tests can supply their
//! own implementations.

mod schedule;
mod service;
mod solenoid;
mod wifi;

pub use schedule::{ScheduleEntry, ScheduleStore};
pub use service::{CommandService, ServiceOutcome};
pub use solenoid::{SolenoidBank, SolenoidDriver};
pub use wifi::{AccessPoint, WifiConfigureService, WifiDriver, WifiScanService};

/// Status for a payload that failed to parse.
pub const STATUS_BAD_PAYLOAD: i8 = -2;
/// Status for a payload that parsed but violates service constraints.
pub const STATUS_INVALID_REQUEST: i8 = -3;
/// Status for a driver-level failure.
pub const STATUS_DRIVER_FAILED: i8 = -4;
