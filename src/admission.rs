//! Device-session admission policy.
//!
//! Fingerprints are opaque client-supplied strings; the bound deters casual
//! account sharing across devices, it is not a security boundary. Credential
//! verification happens upstream of the daemon.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Instructor,
    Student,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "instructor" => Some(Self::Instructor),
            "student" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Instructor => "instructor",
            Self::Student => "student",
        }
    }
}

pub const INSTRUCTOR_DEVICE_LIMIT: usize = 2;
pub const STUDENT_DEVICE_LIMIT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Let the login through. `track_device` means the fingerprint is new and
    /// must be appended to the account's device list.
    Admit { track_device: bool },
    /// Turn the login away; the account already holds `limit` devices.
    Reject { limit: usize },
}

/// Decides one login attempt. Administrators are admitted unconditionally and
/// never tracked; instructors are capped at two devices; students at one,
/// lifted entirely while the subscription flag is active (new devices are
/// still appended so the list survives a lapse).
pub fn evaluate(
    role: Role,
    device_known: bool,
    active_devices: usize,
    subscription_active: bool,
) -> Admission {
    match role {
        Role::Admin => Admission::Admit {
            track_device: false,
        },
        Role::Instructor => {
            if device_known {
                Admission::Admit {
                    track_device: false,
                }
            } else if active_devices < INSTRUCTOR_DEVICE_LIMIT {
                Admission::Admit { track_device: true }
            } else {
                Admission::Reject {
                    limit: INSTRUCTOR_DEVICE_LIMIT,
                }
            }
        }
        Role::Student => {
            if device_known {
                Admission::Admit {
                    track_device: false,
                }
            } else if subscription_active || active_devices < STUDENT_DEVICE_LIMIT {
                Admission::Admit { track_device: true }
            } else {
                Admission::Reject {
                    limit: STUDENT_DEVICE_LIMIT,
                }
            }
        }
    }
}

pub fn reject_message(role: Role) -> String {
    match role {
        Role::Admin => "administrator logins are never limited".to_string(),
        Role::Instructor => format!(
            "instructor accounts may stay signed in on at most {} devices; sign out another device first",
            INSTRUCTOR_DEVICE_LIMIT
        ),
        Role::Student => format!(
            "free student accounts are limited to {} device; sign out the other device or activate a subscription",
            STUDENT_DEVICE_LIMIT
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_is_never_tracked_or_rejected() {
        for count in [0usize, 1, 5, 50] {
            assert_eq!(
                evaluate(Role::Admin, false, count, false),
                Admission::Admit {
                    track_device: false
                }
            );
        }
        assert_eq!(
            evaluate(Role::Admin, true, 0, false),
            Admission::Admit {
                track_device: false
            }
        );
    }

    #[test]
    fn instructor_capped_at_two_unknown_devices() {
        assert_eq!(
            evaluate(Role::Instructor, false, 0, false),
            Admission::Admit { track_device: true }
        );
        assert_eq!(
            evaluate(Role::Instructor, false, 1, false),
            Admission::Admit { track_device: true }
        );
        assert_eq!(
            evaluate(Role::Instructor, false, 2, false),
            Admission::Reject { limit: 2 }
        );
        // A known device is always let back in, even at the cap.
        assert_eq!(
            evaluate(Role::Instructor, true, 2, false),
            Admission::Admit {
                track_device: false
            }
        );
    }

    #[test]
    fn unsubscribed_student_capped_at_one_device() {
        assert_eq!(
            evaluate(Role::Student, false, 0, false),
            Admission::Admit { track_device: true }
        );
        assert_eq!(
            evaluate(Role::Student, false, 1, false),
            Admission::Reject { limit: 1 }
        );
        assert_eq!(
            evaluate(Role::Student, true, 1, false),
            Admission::Admit {
                track_device: false
            }
        );
    }

    #[test]
    fn subscribed_student_is_unlimited_but_still_tracked() {
        for count in [0usize, 1, 3, 10] {
            assert_eq!(
                evaluate(Role::Student, false, count, true),
                Admission::Admit { track_device: true }
            );
        }
    }

    #[test]
    fn lapsed_subscription_keeps_known_devices_usable() {
        // Devices appended while subscribed stay on the list; after a lapse
        // they admit via the known-device branch while unknown ones bounce.
        assert_eq!(
            evaluate(Role::Student, true, 4, false),
            Admission::Admit {
                track_device: false
            }
        );
        assert_eq!(
            evaluate(Role::Student, false, 4, false),
            Admission::Reject { limit: 1 }
        );
    }

    #[test]
    fn role_tags_round_trip() {
        for role in [Role::Admin, Role::Instructor, Role::Student] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("principal"), None);
    }
}
