//! Identity resolution for the restricted user a shell drops to.
//!
//! The resolver asks an [`IdentityDatabase`] four questions in order (uid,
//! primary gid, membership list, id of every listed group) and only hands out
//! a [`UserCredential`] when the uid and gid are both non-root.
//!
//! Two databases are provided. [`NativeIdentityDb`] reads the passwd and group
//! databases directly and is the default. [`CommandIdentityDb`] shells out to
//! `id`, `groups` and `getent` and parses their text, for hosts where the
//! account lives behind a name service that only those tools see.

use nix::unistd::{Gid, Group, User, getgrouplist};
use std::ffi::CString;
use std::process::Command;
use tracing::{debug, error, info};

use crate::error::{CredentialError, LookupStep};

/// Resolved identity of the restricted user.
///
/// Only [`CredentialResolver::resolve`] builds one, so `uid` and `gid` are
/// always non-zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserCredential {
    uid: u32,
    gid: u32,
    groups: Vec<u32>,
}

impl UserCredential {
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Supplementary groups, in membership order. May be empty.
    pub fn groups(&self) -> &[u32] {
        &self.groups
    }
}

/// The four identity lookups a resolution needs.
pub trait IdentityDatabase {
    fn uid(&self, user: &str) -> Result<u32, CredentialError>;
    fn gid(&self, user: &str) -> Result<u32, CredentialError>;
    /// Names of every group `user` belongs to
    fn group_names(&self, user: &str) -> Result<Vec<String>, CredentialError>;
    fn group_id(&self, group: &str) -> Result<u32, CredentialError>;
}

impl<T: IdentityDatabase + ?Sized> IdentityDatabase for Box<T> {
    fn uid(&self, user: &str) -> Result<u32, CredentialError> {
        (**self).uid(user)
    }

    fn gid(&self, user: &str) -> Result<u32, CredentialError> {
        (**self).gid(user)
    }

    fn group_names(&self, user: &str) -> Result<Vec<String>, CredentialError> {
        (**self).group_names(user)
    }

    fn group_id(&self, group: &str) -> Result<u32, CredentialError> {
        (**self).group_id(group)
    }
}

/// Direct passwd/group database lookups
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeIdentityDb;

impl NativeIdentityDb {
    fn user(step: LookupStep, name: &str) -> Result<User, CredentialError> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(CredentialError::query(step, name, "no such user")),
            Err(e) => Err(CredentialError::query(step, name, e)),
        }
    }
}

impl IdentityDatabase for NativeIdentityDb {
    fn uid(&self, user: &str) -> Result<u32, CredentialError> {
        Ok(Self::user(LookupStep::Uid, user)?.uid.as_raw())
    }

    fn gid(&self, user: &str) -> Result<u32, CredentialError> {
        Ok(Self::user(LookupStep::Gid, user)?.gid.as_raw())
    }

    fn group_names(&self, user: &str) -> Result<Vec<String>, CredentialError> {
        let entry = Self::user(LookupStep::Groups, user)?;
        let c_name =
            CString::new(user).map_err(|e| CredentialError::query(LookupStep::Groups, user, e))?;
        let gids = getgrouplist(&c_name, entry.gid)
            .map_err(|e| CredentialError::query(LookupStep::Groups, user, e))?;

        gids.into_iter()
            .map(|gid| match Group::from_gid(gid) {
                Ok(Some(group)) => Ok(group.name),
                Ok(None) => Err(CredentialError::query(
                    LookupStep::Groups,
                    user,
                    format!("no group entry for gid {}", gid),
                )),
                Err(e) => Err(CredentialError::query(LookupStep::Groups, user, e)),
            })
            .collect()
    }

    fn group_id(&self, group: &str) -> Result<u32, CredentialError> {
        match Group::from_name(group) {
            Ok(Some(entry)) => Ok(entry.gid.as_raw()),
            Ok(None) => Err(CredentialError::query(
                LookupStep::GroupId,
                group,
                "no such group",
            )),
            Err(e) => Err(CredentialError::query(LookupStep::GroupId, group, e)),
        }
    }
}

/// Lookups through `id`, `groups` and `getent group`
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandIdentityDb;

impl CommandIdentityDb {
    fn run(step: LookupStep, name: &str, program: &str, args: &[&str]) -> Result<String, CredentialError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| CredentialError::query(step, name, format!("{}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CredentialError::query(
                step,
                name,
                format!("{} exited with {}: {}", program, output.status, stderr.trim()),
            ));
        }

        String::from_utf8(output.stdout).map_err(|e| CredentialError::query(step, name, e))
    }
}

impl IdentityDatabase for CommandIdentityDb {
    fn uid(&self, user: &str) -> Result<u32, CredentialError> {
        let out = Self::run(LookupStep::Uid, user, "id", &["-u", user])?;
        parse_numeric_id(LookupStep::Uid, user, &out)
    }

    fn gid(&self, user: &str) -> Result<u32, CredentialError> {
        let out = Self::run(LookupStep::Gid, user, "id", &["-g", user])?;
        parse_numeric_id(LookupStep::Gid, user, &out)
    }

    fn group_names(&self, user: &str) -> Result<Vec<String>, CredentialError> {
        let out = Self::run(LookupStep::Groups, user, "groups", &[user])?;
        parse_group_membership(user, &out)
    }

    fn group_id(&self, group: &str) -> Result<u32, CredentialError> {
        let out = Self::run(LookupStep::GroupId, group, "getent", &["group", group])?;
        parse_group_record(group, &out)
    }
}

pub(crate) fn parse_numeric_id(
    step: LookupStep,
    name: &str,
    output: &str,
) -> Result<u32, CredentialError> {
    output
        .trim()
        .parse::<u32>()
        .map_err(|e| CredentialError::query(step, name, format!("{:?}: {}", output.trim(), e)))
}

/// Parse `groups <user>` output, e.g. `session-user : session-user wheel`.
///
/// The first two tokens are the `<user> :` header and are skipped; every token
/// after them is a group name. A header that does not look like that is
/// rejected instead of being read as group names.
pub fn parse_group_membership(user: &str, output: &str) -> Result<Vec<String>, CredentialError> {
    let mut tokens = output.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(name), Some(":")) if name == user => {}
        _ => {
            return Err(CredentialError::query(
                LookupStep::Groups,
                user,
                format!("unexpected membership header in {:?}", output.trim()),
            ));
        }
    }
    Ok(tokens.map(str::to_string).collect())
}

/// Extract the numeric id from a `getent group` record (`name:x:1004:members`).
pub fn parse_group_record(group: &str, record: &str) -> Result<u32, CredentialError> {
    let field = record.split(':').nth(2).ok_or_else(|| {
        CredentialError::query(
            LookupStep::GroupId,
            group,
            format!("malformed group record {:?}", record.trim()),
        )
    })?;
    parse_numeric_id(LookupStep::GroupId, group, field)
}

/// Resolves a [`UserCredential`] for one fixed username
pub struct CredentialResolver<D = NativeIdentityDb> {
    db: D,
    username: String,
}

impl CredentialResolver<NativeIdentityDb> {
    pub fn native(username: impl Into<String>) -> Self {
        Self::new(NativeIdentityDb, username)
    }
}

impl<D: IdentityDatabase> CredentialResolver<D> {
    pub fn new(db: D, username: impl Into<String>) -> Self {
        Self {
            db,
            username: username.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Run every lookup in order. The first failure aborts; nothing is retried.
    pub fn resolve(&self) -> Result<UserCredential, CredentialError> {
        let name = self.username.as_str();

        let uid = self.db.uid(name).inspect_err(|e| error!("{}", e))?;
        let gid = self.db.gid(name).inspect_err(|e| error!("{}", e))?;

        let group_names = self.db.group_names(name).inspect_err(|e| error!("{}", e))?;
        let mut groups = Vec::with_capacity(group_names.len());
        for group in &group_names {
            let id = self.db.group_id(group).inspect_err(|e| error!("{}", e))?;
            groups.push(id);
        }

        if uid == 0 || gid == 0 {
            error!("Refusing credential for {}: uid={} gid={}", name, uid, gid);
            return Err(CredentialError::Invalid {
                name: name.to_string(),
                uid,
                gid,
            });
        }

        debug!(uid, gid, ?groups, "Resolved credential for {}", name);
        Ok(UserCredential { uid, gid, groups })
    }
}

/// Makes sure the restricted account exists before its identity is resolved.
pub trait UserProvisioner {
    fn ensure_user(&self, username: &str) -> Result<(), CredentialError>;
}

/// The account is created out of band; nothing to do here.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreprovisionedUser;

impl UserProvisioner for PreprovisionedUser {
    fn ensure_user(&self, username: &str) -> Result<(), CredentialError> {
        info!("Expecting restricted user {} to be provisioned", username);
        Ok(())
    }
}

pub(crate) fn to_gids(groups: &[u32]) -> Vec<Gid> {
    groups.iter().copied().map(Gid::from_raw).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityLookup;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeDb {
        uid: Option<u32>,
        gid: Option<u32>,
        members: Vec<&'static str>,
        groups: HashMap<&'static str, u32>,
    }

    impl IdentityDatabase for FakeDb {
        fn uid(&self, user: &str) -> Result<u32, CredentialError> {
            self.uid
                .ok_or_else(|| CredentialError::query(LookupStep::Uid, user, "no such user"))
        }

        fn gid(&self, user: &str) -> Result<u32, CredentialError> {
            self.gid
                .ok_or_else(|| CredentialError::query(LookupStep::Gid, user, "no such user"))
        }

        fn group_names(&self, _user: &str) -> Result<Vec<String>, CredentialError> {
            Ok(self.members.iter().map(|s| s.to_string()).collect())
        }

        fn group_id(&self, group: &str) -> Result<u32, CredentialError> {
            self.groups
                .get(group)
                .copied()
                .ok_or_else(|| CredentialError::query(LookupStep::GroupId, group, "no such group"))
        }
    }

    fn healthy_db() -> FakeDb {
        FakeDb {
            uid: Some(1001),
            gid: Some(1001),
            members: vec!["session-user", "audit"],
            groups: HashMap::from([("session-user", 1001), ("audit", 1004)]),
        }
    }

    #[test]
    fn test_resolve_collects_groups_in_order() {
        let resolver = CredentialResolver::new(healthy_db(), "session-user");
        let cred = resolver.resolve().unwrap();
        assert_eq!(cred.uid(), 1001);
        assert_eq!(cred.gid(), 1001);
        assert_eq!(cred.groups(), &[1001, 1004]);
    }

    #[test]
    fn test_boxed_database_resolves() {
        let db: Box<dyn IdentityDatabase> = Box::new(healthy_db());
        let cred = CredentialResolver::new(db, "session-user").resolve().unwrap();
        assert_eq!(cred.groups(), &[1001, 1004]);
    }

    #[test]
    fn test_configured_lookup_backends() {
        for lookup in [IdentityLookup::Native, IdentityLookup::Command] {
            let err = CredentialResolver::new(lookup.database(), "no-such-user-for-shell-pty-tests")
                .resolve()
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    CredentialError::Query {
                        step: LookupStep::Uid,
                        ..
                    }
                ),
                "{lookup:?}: {err}"
            );
        }
    }

    #[test]
    fn test_resolve_allows_empty_groups() {
        let db = FakeDb {
            members: vec![],
            ..healthy_db()
        };
        let cred = CredentialResolver::new(db, "session-user").resolve().unwrap();
        assert!(cred.groups().is_empty());
    }

    #[test]
    fn test_zero_uid_is_invalid() {
        let db = FakeDb {
            uid: Some(0),
            ..healthy_db()
        };
        let err = CredentialResolver::new(db, "session-user").resolve().unwrap_err();
        assert!(matches!(err, CredentialError::Invalid { uid: 0, .. }));
    }

    #[test]
    fn test_zero_gid_is_invalid() {
        let db = FakeDb {
            gid: Some(0),
            ..healthy_db()
        };
        let err = CredentialResolver::new(db, "session-user").resolve().unwrap_err();
        assert!(matches!(err, CredentialError::Invalid { gid: 0, .. }));
    }

    #[test]
    fn test_missing_user_fails_on_uid_step() {
        let db = FakeDb::default();
        let err = CredentialResolver::new(db, "ghost").resolve().unwrap_err();
        match err {
            CredentialError::Query { step, name, .. } => {
                assert_eq!(step, LookupStep::Uid);
                assert_eq!(name, "ghost");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_group_aborts_resolution() {
        let db = FakeDb {
            members: vec!["session-user", "vanished"],
            ..healthy_db()
        };
        let err = CredentialResolver::new(db, "session-user").resolve().unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Query {
                step: LookupStep::GroupId,
                ref name,
                ..
            } if name == "vanished"
        ));
    }

    #[test]
    fn test_membership_skips_two_header_tokens() {
        let groups =
            parse_group_membership("session-user", "session-user : session-user test\n").unwrap();
        assert_eq!(groups, vec!["session-user", "test"]);
    }

    #[test]
    fn test_membership_without_groups() {
        let groups = parse_group_membership("session-user", "session-user :\n").unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_membership_rejects_unexpected_header() {
        let err = parse_group_membership("session-user", "session-user wheel audit").unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Query {
                step: LookupStep::Groups,
                ..
            }
        ));
    }

    #[test]
    fn test_group_record_third_field() {
        assert_eq!(parse_group_record("test", "test:x:1004:session-user\n").unwrap(), 1004);
        assert!(parse_group_record("test", "test:x").is_err());
        assert!(parse_group_record("test", "test:x:abc:").is_err());
    }

    #[test]
    fn test_numeric_id_is_trimmed() {
        assert_eq!(parse_numeric_id(LookupStep::Uid, "u", " 1001\n").unwrap(), 1001);
        assert!(parse_numeric_id(LookupStep::Uid, "u", "-1").is_err());
        assert!(parse_numeric_id(LookupStep::Uid, "u", "").is_err());
    }

    #[test]
    fn test_command_db_unknown_user() {
        let err = CredentialResolver::new(CommandIdentityDb, "no-such-user-for-shell-pty-tests")
            .resolve()
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Query {
                step: LookupStep::Uid,
                ..
            }
        ));
    }

    #[test]
    fn test_native_unknown_user() {
        let err = CredentialResolver::native("no-such-user-for-shell-pty-tests")
            .resolve()
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Query {
                step: LookupStep::Uid,
                ..
            }
        ));
    }

    #[test]
    fn test_native_root_is_rejected() {
        let err = CredentialResolver::native("root").resolve().unwrap_err();
        assert!(matches!(err, CredentialError::Invalid { uid: 0, .. }));
    }
}
