pub mod logs;
pub mod pointer;
pub mod random;

/// Translation between a machine's numerical id and its reachable address.
/// Ids are zero-based and contiguous for the lifetime of a job; how names
/// map to ids is up to the caller.
#[derive(Clone, Debug)]
pub struct MachineInfo {
    pub id: u16,
    pub address: String,
}
