//! Key layout for the consensus store.
//!
//! All cluster state lives under a small set of fixed prefixes:
//!
//! - `/config/version` — monotonically nondecreasing configuration version
//! - `/config/objects/<name>` — configuration objects, opaque to this layer
//! - `/status/objects/<kind>/<member>` — per-member status documents
//! - `/leases/<member>` — the hex lease id each member publishes for itself
//!
//! Every function is a pure prefix join; prefixes never overlap.

const CONFIG_VERSION_KEY: &str = "/config/version";
const CONFIG_OBJECT_PREFIX: &str = "/config/objects/";
const STATUS_OBJECT_PREFIX: &str = "/status/objects/";
const LEASE_PREFIX: &str = "/leases/";

/// Status kind under which member heartbeat documents are published.
pub const STATUS_MEMBER_KIND: &str = "cluster";

/// The key naming convention, bound to one member name.
#[derive(Debug, Clone)]
pub struct Layout {
    member_name: String,
}

impl Layout {
    pub fn new(member_name: &str) -> Self {
        Self {
            member_name: member_name.to_string(),
        }
    }

    /// Key holding the configuration version counter.
    pub fn config_version(&self) -> String {
        CONFIG_VERSION_KEY.to_string()
    }

    /// Key of a named configuration object.
    pub fn config_object_key(&self, name: &str) -> String {
        format!("{CONFIG_OBJECT_PREFIX}{name}")
    }

    /// Prefix under which all configuration objects live.
    pub fn config_object_prefix(&self) -> String {
        CONFIG_OBJECT_PREFIX.to_string()
    }

    /// Prefix of the status rows of one kind, across all members.
    pub fn status_object_prefix(&self, kind: &str) -> String {
        format!("{STATUS_OBJECT_PREFIX}{kind}/")
    }

    /// Prefix under which all status rows of all kinds live.
    pub fn status_objects_prefix(&self) -> String {
        STATUS_OBJECT_PREFIX.to_string()
    }

    /// Key of this member's own heartbeat status document.
    pub fn status_member_key(&self) -> String {
        format!("{STATUS_OBJECT_PREFIX}{STATUS_MEMBER_KIND}/{}", self.member_name)
    }

    /// Key under which this member publishes its own lease id.
    pub fn lease(&self) -> String {
        format!("{LEASE_PREFIX}{}", self.member_name)
    }

    /// Lease key of another member.
    pub fn other_lease(&self, member_name: &str) -> String {
        format!("{LEASE_PREFIX}{member_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new("member-001")
    }

    #[test]
    fn test_config_keys() {
        assert_eq!(layout().config_version(), "/config/version");
        assert_eq!(
            layout().config_object_key("http-server"),
            "/config/objects/http-server"
        );
        assert_eq!(layout().config_object_prefix(), "/config/objects/");
    }

    #[test]
    fn test_status_keys() {
        assert_eq!(
            layout().status_object_prefix("pipeline"),
            "/status/objects/pipeline/"
        );
        assert_eq!(layout().status_objects_prefix(), "/status/objects/");
        assert_eq!(
            layout().status_member_key(),
            "/status/objects/cluster/member-001"
        );
    }

    #[test]
    fn test_lease_keys() {
        assert_eq!(layout().lease(), "/leases/member-001");
        assert_eq!(layout().other_lease("member-002"), "/leases/member-002");
    }

    #[test]
    fn test_prefixes_do_not_overlap() {
        let l = layout();
        let prefixes = [
            l.config_object_prefix(),
            l.status_objects_prefix(),
            "/leases/".to_string(),
        ];
        for (i, a) in prefixes.iter().enumerate() {
            for (j, b) in prefixes.iter().enumerate() {
                if i != j {
                    assert!(!a.starts_with(b.as_str()));
                }
            }
        }
        assert!(!l.config_version().starts_with(&l.config_object_prefix()));
    }

    #[test]
    fn test_status_member_key_lives_under_status_prefix() {
        let l = layout();
        assert!(
            l.status_member_key()
                .starts_with(&l.status_object_prefix(STATUS_MEMBER_KIND))
        );
    }
}
