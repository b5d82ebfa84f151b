use crate::domain::UserId;

// ============== Authorization ==============

/// Admin capability check against the single configured identity.
pub fn is_admin(user_id: Option<UserId>, admin_id: Option<i64>) -> bool {
    match (user_id, admin_id) {
        (Some(user), Some(admin)) => user.0 == admin,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_configured_admin_passes() {
        assert!(is_admin(Some(UserId(7)), Some(7)));
        assert!(!is_admin(Some(UserId(8)), Some(7)));
        assert!(!is_admin(None, Some(7)));
        assert!(!is_admin(Some(UserId(7)), None));
    }
}
