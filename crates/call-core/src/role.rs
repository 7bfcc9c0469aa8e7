use crate::config::MAX_PARTICIPANTS;
use crate::error::CallError;

/// Which side of the exchange this peer plays. The offerer is impolite: it
/// wins offer collisions. The answerer is polite and yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRole {
    pub is_offerer: bool,
}

impl PeerRole {
    pub const OFFERER: PeerRole = PeerRole { is_offerer: true };
    pub const ANSWERER: PeerRole = PeerRole { is_offerer: false };

    pub fn is_polite(self) -> bool {
        !self.is_offerer
    }

    pub fn as_str(self) -> &'static str {
        if self.is_offerer { "offerer" } else { "answerer" }
    }
}

pub struct RoleResolver;

impl RoleResolver {
    /// Decides the role from the membership snapshot seen at subscribe time.
    /// The snapshot includes the local peer: alone means answerer, a pair
    /// means the local peer arrived second and makes the offer.
    pub fn resolve(members: &[String], local_id: &str) -> Result<PeerRole, CallError> {
        let occupants = if members.iter().any(|member| member == local_id) {
            members.len()
        } else {
            members.len() + 1
        };
        match occupants {
            n if n > MAX_PARTICIPANTS => Err(CallError::RoomFull { occupants: n }),
            n if n == MAX_PARTICIPANTS => Ok(PeerRole::OFFERER),
            _ => Ok(PeerRole::ANSWERER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn first_member_answers_politely() {
        let role = RoleResolver::resolve(&ids(&["a"]), "a").unwrap();
        assert!(!role.is_offerer);
        assert!(role.is_polite());
    }

    #[test]
    fn second_member_offers_impolitely() {
        let role = RoleResolver::resolve(&ids(&["a", "b"]), "b").unwrap();
        assert_eq!(role, PeerRole::OFFERER);
        assert!(!role.is_polite());
    }

    #[test]
    fn exactly_one_offerer_per_pair() {
        let first = RoleResolver::resolve(&ids(&["a"]), "a").unwrap();
        let second = RoleResolver::resolve(&ids(&["a", "b"]), "b").unwrap();
        assert_ne!(first.is_offerer, second.is_offerer);
        assert_ne!(first.is_polite(), second.is_polite());
    }

    #[test]
    fn third_member_is_rejected() {
        let err = RoleResolver::resolve(&ids(&["a", "b", "c"]), "c").unwrap_err();
        assert_eq!(err, CallError::RoomFull { occupants: 3 });
    }

    #[test]
    fn snapshot_without_self_counts_local_peer() {
        assert_eq!(RoleResolver::resolve(&ids(&["a"]), "b").unwrap(), PeerRole::OFFERER);
        assert_eq!(RoleResolver::resolve(&[], "b").unwrap(), PeerRole::ANSWERER);
    }
}
