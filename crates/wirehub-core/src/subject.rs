use crate::ids::{ConnectionId, GroupName, UserId};

/// Maps routing targets onto bus subjects for one hub type.
///
/// The hub discriminator keeps distinct hub types from colliding on a shared
/// bus. Subjects are plain concatenations with `.` separators — identifiers
/// containing the separator can collide across categories, so callers must
/// keep `.` out of connection/group/user names when interoperating with an
/// existing bus namespace.
#[derive(Clone, Debug)]
pub struct SubjectSpace {
    hub: String,
}

impl SubjectSpace {
    pub fn new(hub: impl Into<String>) -> Self {
        Self { hub: hub.into() }
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Broadcast subject: every process with local connections listens here.
    pub fn all(&self) -> String {
        self.hub.clone()
    }

    pub fn connection(&self, id: &ConnectionId) -> String {
        format!("{}.conn.{}", self.hub, id)
    }

    pub fn group(&self, name: &GroupName) -> String {
        format!("{}.group.{}", self.hub, name)
    }

    pub fn user(&self, id: &UserId) -> String {
        format!("{}.user.{}", self.hub, id)
    }

    /// Subject carrying group membership commands and their acks.
    pub fn group_management(&self) -> String {
        format!("{}.groupmgmt", self.hub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_prefixed_by_hub() {
        let subjects = SubjectSpace::new("chat");
        assert_eq!(subjects.all(), "chat");
        assert_eq!(subjects.connection(&ConnectionId::new("c1")), "chat.conn.c1");
        assert_eq!(subjects.group(&GroupName::new("g1")), "chat.group.g1");
        assert_eq!(subjects.user(&UserId::new("u1")), "chat.user.u1");
        assert_eq!(subjects.group_management(), "chat.groupmgmt");
    }

    #[test]
    fn distinct_hubs_never_share_subjects() {
        let a = SubjectSpace::new("chat");
        let b = SubjectSpace::new("presence");
        let id = ConnectionId::new("c1");
        assert_ne!(a.connection(&id), b.connection(&id));
        assert_ne!(a.group_management(), b.group_management());
    }
}
