//! Instance identifiers for observed processes

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha224};
use warden_api::Instance;
use warden_host_api::ProcessInfo;
use warden_util::InstanceId;

/// Derive an instance ID for a process.
///
/// The ID is a hash of the process's unique ID, owner and name, so it is
/// distinct for every process the host ever runs.
pub fn new_instance_id(info: &ProcessInfo) -> InstanceId {
    let mut hash = Sha224::new();
    hash.update(info.unique_id.pid.to_le_bytes());
    hash.update(info.unique_id.created.to_le_bytes());
    hash.update(info.session.uid.to_le_bytes());
    hash.update(info.name.as_bytes());
    InstanceId::new(URL_SAFE_NO_PAD.encode(hash.finalize()))
}

/// The lease instance for a process on `host`
pub fn process_instance(host: &str, info: &ProcessInfo) -> Instance {
    Instance::new(host, info.user.clone(), new_instance_id(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_host_api::{Session, UniqueId};

    fn process(pid: u32, created: u64) -> ProcessInfo {
        ProcessInfo {
            unique_id: UniqueId::new(pid, created),
            name: "app".into(),
            path: "/usr/bin/app".into(),
            command_line: vec!["/usr/bin/app".into()],
            session: Session { id: 2, uid: 1000, gid: 1000 },
            user: "alice".into(),
            protected: false,
        }
    }

    #[test]
    fn recycled_pids_get_new_ids() {
        let a = new_instance_id(&process(42, 1));
        let b = new_instance_id(&process(42, 2));
        assert_ne!(a, b);
        assert_eq!(a, new_instance_id(&process(42, 1)));
        // 28 bytes encode to 38 characters without padding
        assert_eq!(a.as_str().len(), 38);
    }

    #[test]
    fn instance_names_host_and_user() {
        let instance = process_instance("H1", &process(42, 1));
        assert_eq!(instance.host, "H1");
        assert_eq!(instance.user, "alice");
        assert!(!instance.id.is_empty());
    }
}
