//! Device health readings used to build the periodic snapshot.

use custodian_types::{BatteryInfo, CustodianError, NetworkInfo, StorageInfo};

pub trait DeviceProbe: Send + Sync {
    fn battery(&self) -> Result<BatteryInfo, CustodianError>;
    fn storage(&self) -> Result<StorageInfo, CustodianError>;
    fn network(&self) -> Result<NetworkInfo, CustodianError>;
}
