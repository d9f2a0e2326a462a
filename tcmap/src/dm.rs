//! dm-crypt mapping setup
//!
//! Hands the volume descriptor over to the kernel device-mapper: a single
//! `crypt` target covering the master-key scope, identified by the chosen
//! mapping name and a freshly drawn UUID.

use crate::MapError;
use devicemapper::{DevId, DmName, DmOptions, DmUuid, DM};
use tcvol::VolumeInfo;
use tracing::debug;
use uuid::Uuid;

/// Creates and activates the dm-crypt mapping for an unlocked volume
///
/// The target parameter line embeds the hex master key; it necessarily
/// crosses the ioctl boundary in the clear, but the secure buffer it was
/// assembled in is wiped on return.
pub fn dm_setup(map_name: &str, info: &VolumeInfo) -> Result<(), MapError> {
    let params = info.dm_params()?;
    let params = std::str::from_utf8(&params)
        .unwrap() // the parameter line is assembled from ASCII pieces
        .to_string();

    let dm = DM::new()?;
    let name = DmName::new(map_name)?;
    let uuid = Uuid::new_v4().to_string();
    let uuid = DmUuid::new(&uuid)?;

    debug!(
        "creating crypt target {}: start {}, {} sectors",
        map_name,
        info.start(),
        info.size()
    );
    dm.device_create(name, Some(uuid), DmOptions::default())?;
    let id = DevId::Name(name);
    let table = vec![(
        info.start(),
        info.size(),
        "crypt".to_string(),
        params,
    )];
    dm.table_load(&id, &table, DmOptions::default())?;
    dm.device_suspend(&id, DmOptions::default())?; // no suspend flag: resumes
    Ok(())
}
