use crate::RoomError;
use serde::{Deserialize, Serialize};
use syncroom_common::{Permission, Role};

const BASE: u64 = Permission::PlaybackPlayPause.bit()
    | Permission::PlaybackSkip.bit()
    | Permission::PlaybackSeek.bit()
    | Permission::ManageQueueAdd.bit()
    | Permission::ManageQueueVote.bit()
    | Permission::Chat.bit();

const REGISTERED: u64 = BASE | Permission::ManageQueueRemove.bit();

const TRUSTED: u64 = REGISTERED | Permission::ManageQueueOrder.bit();

const MODERATOR: u64 = TRUSTED
    | Permission::ManageUsersPromoteTrustedUser.bit()
    | Permission::ManageUsersDemoteTrustedUser.bit();

const ADMINISTRATOR: u64 = MODERATOR
    | Permission::ManageUsersPromoteModerator.bit()
    | Permission::ManageUsersDemoteModerator.bit();

/// Role → permission-set bitmask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    masks: [u64; Role::COUNT],
}

impl Default for Grants {
    fn default() -> Self {
        let mut masks = [0; Role::COUNT];
        masks[Role::UnregisteredUser.index()] = BASE;
        masks[Role::RegisteredUser.index()] = REGISTERED;
        masks[Role::TrustedUser.index()] = TRUSTED;
        masks[Role::Moderator.index()] = MODERATOR;
        masks[Role::Administrator.index()] = ADMINISTRATOR;
        masks[Role::Owner.index()] = u64::MAX;
        Self { masks }
    }
}

impl Grants {
    pub fn granted(&self, role: Role, permission: Permission) -> bool {
        self.masks[role.index()] & permission.bit() != 0
    }

    pub fn check(&self, role: Role, permission: Permission) -> Result<(), RoomError> {
        if self.granted(role, permission) {
            Ok(())
        } else {
            Err(RoomError::PermissionDenied(permission.name()))
        }
    }

    /// Serializable mask for one role, used only for outgoing sync.
    pub fn get_mask(&self, role: Role) -> u64 {
        self.masks[role.index()]
    }

    pub fn set_all_grants(&mut self, other: &Grants) {
        self.masks = other.masks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_widen_with_authority() {
        let grants = Grants::default();
        for window in Role::ALL.windows(2) {
            let (lower, higher) = (window[0], window[1]);
            let (l, h) = (grants.get_mask(lower), grants.get_mask(higher));
            assert_eq!(l & h, l, "{lower:?} must be a subset of {higher:?}");
        }
    }

    #[test]
    fn check_reports_the_missing_permission() {
        let grants = Grants::default();
        assert!(grants
            .check(Role::UnregisteredUser, Permission::Chat)
            .is_ok());
        let err = grants
            .check(Role::RegisteredUser, Permission::ManageUsersPromoteAdmin)
            .unwrap_err();
        assert!(matches!(
            err,
            RoomError::PermissionDenied("manage-users.promote-admin")
        ));
    }

    #[test]
    fn moderators_manage_trusted_users_only() {
        let grants = Grants::default();
        assert!(grants.granted(Role::Moderator, Permission::ManageUsersPromoteTrustedUser));
        assert!(!grants.granted(Role::Moderator, Permission::ManageUsersPromoteModerator));
        assert!(grants.granted(Role::Administrator, Permission::ManageUsersDemoteModerator));
        assert!(!grants.granted(Role::Administrator, Permission::ManageUsersPromoteAdmin));
    }

    #[test]
    fn set_all_grants_replaces_every_mask() {
        let mut grants = Grants::default();
        let mut other = Grants::default();
        other.masks[Role::UnregisteredUser.index()] = 0;
        grants.set_all_grants(&other);
        assert_eq!(grants.get_mask(Role::UnregisteredUser), 0);
    }
}
