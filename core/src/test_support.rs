//! Shared scaffolding for unit tests across modules: a freshly initialised
//! device backed by a temp file, ready to open.

use crate::device::DeviceContext;

pub fn make_device(size: u64) -> tempfile::NamedTempFile {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(size).unwrap();
    DeviceContext::init(tmp.path()).unwrap();
    tmp
}
