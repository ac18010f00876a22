//! Pre-shared identity/key store.
//!
//! The first pair ever added is the default identity and default key until
//! changed. Defaults are positions in the store, so re-keying an identity
//! moves its default along with it. The store answers the engine's credential requests through
//! [`SecurityStore::lookup_credential`], which runs inside an engine callback
//! and therefore never blocks.

use sealgram_common::helpers::constant_time_eq;
use sealgram_common::{Error, Result};
use zeroize::Zeroizing;

use crate::engine::{AlertDescription, CredentialKind};

/// Identity to key mapping with default fallback.
///
/// The empty identity stands for "no identity".
#[derive(Default)]
pub struct SecurityStore {
    entries: Vec<(Vec<u8>, Zeroizing<Vec<u8>>)>,
    // Indices into `entries`. Entries are never removed.
    default_identity: usize,
    default_key: usize,
}

impl std::fmt::Debug for SecurityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityStore")
            .field("entries", &self.entries.len())
            .field("default_identity", &self.default_identity().ok())
            .finish_non_exhaustive()
    }
}

impl SecurityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key for `identity`.
    ///
    /// Replacing keeps the identity's original position. The old key buffer
    /// is wiped when dropped.
    pub fn add_identity(&mut self, identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Result<()> {
        let identity = identity.into();
        let key = Zeroizing::new(key.into());
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }

        match self.entries.iter_mut().find(|(id, _)| *id == identity) {
            Some((_, existing)) => *existing = key,
            None => self.entries.push((identity, key)),
        }
        Ok(())
    }

    /// Add a key that is not bound to any identity.
    pub fn add_key(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.add_identity(Vec::new(), key)
    }

    /// Key stored for `identity`, if any.
    pub fn key(&self, identity: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(id, _)| id.as_slice() == identity)
            .map(|(_, key)| key.as_slice())
    }

    pub fn default_identity(&self) -> Result<&[u8]> {
        self.entries
            .get(self.default_identity)
            .map(|(id, _)| id.as_slice())
            .ok_or(Error::EmptyStore)
    }

    pub fn default_key(&self) -> Result<&[u8]> {
        self.entries
            .get(self.default_key)
            .map(|(_, key)| key.as_slice())
            .ok_or(Error::EmptyStore)
    }

    /// Make an already stored identity the default.
    pub fn set_default_identity(&mut self, identity: &[u8]) -> Result<()> {
        self.default_identity = self.identity_index(identity)?;
        Ok(())
    }

    /// Make an already stored key the default.
    pub fn set_default_key(&mut self, key: &[u8]) -> Result<()> {
        self.default_key = self.key_index(key)?;
        Ok(())
    }

    /// Set both defaults. Nothing changes unless both are known.
    pub fn set_defaults(&mut self, identity: &[u8], key: &[u8]) -> Result<()> {
        let identity = self.identity_index(identity)?;
        let key = self.key_index(key)?;
        self.default_identity = identity;
        self.default_key = key;
        Ok(())
    }

    fn identity_index(&self, identity: &[u8]) -> Result<usize> {
        self.entries
            .iter()
            .position(|(id, _)| id.as_slice() == identity)
            .ok_or(Error::UnknownIdentity)
    }

    // Compares against every stored key so timing does not reveal a match.
    fn key_index(&self, key: &[u8]) -> Result<usize> {
        let mut found = None;
        for (i, (_, stored)) in self.entries.iter().enumerate() {
            if constant_time_eq(stored, key) && found.is_none() {
                found = Some(i);
            }
        }
        found.ok_or(Error::UnknownKey)
    }

    /// Number of stored identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Answer an engine credential request by copying into `out`.
    ///
    /// Keys are looked up by `hint` when one is given, else the default key
    /// is used. A missing credential maps to `DecryptError`, one that does
    /// not fit in `out` to `InternalError`. Hint requests are unsupported and
    /// return zero.
    pub fn lookup_credential(
        &self,
        kind: CredentialKind,
        hint: Option<&[u8]>,
        out: &mut [u8],
    ) -> std::result::Result<usize, AlertDescription> {
        let credential = match kind {
            CredentialKind::Hint => return Ok(0),
            CredentialKind::Identity => self.default_identity().ok(),
            CredentialKind::Key => match hint {
                Some(identity) => self.key(identity),
                None => self.default_key().ok(),
            },
        };

        let credential = credential.ok_or(AlertDescription::DecryptError)?;
        if credential.len() > out.len() {
            return Err(AlertDescription::InternalError);
        }
        out[..credential.len()].copy_from_slice(credential);
        Ok(credential.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_pair_is_default() {
        let mut store = SecurityStore::new();
        store.add_identity("foo", "bar").unwrap();
        store.add_identity("bar", "foo").unwrap();

        assert_eq!(store.default_identity().unwrap(), b"foo");
        assert_eq!(store.default_key().unwrap(), b"bar");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_empty_store_has_no_default() {
        let store = SecurityStore::new();
        assert!(matches!(store.default_identity(), Err(Error::EmptyStore)));
        assert!(matches!(store.default_key(), Err(Error::EmptyStore)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_key_rejected() {
        let mut store = SecurityStore::new();
        assert!(matches!(store.add_identity("foo", ""), Err(Error::InvalidKey)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_key_keeps_position() {
        let mut store = SecurityStore::new();
        store.add_identity("a", "k1").unwrap();
        store.add_identity("b", "k2").unwrap();
        store.add_identity("a", "k3").unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.key(b"a"), Some(&b"k3"[..]));
        assert_eq!(store.default_identity().unwrap(), b"a");
        assert_eq!(store.default_key().unwrap(), b"k3");
    }

    #[test]
    fn test_rekeyed_default_is_served() {
        let mut store = SecurityStore::new();
        store.add_identity("a", "k1").unwrap();
        store.add_identity("a", "k2").unwrap();

        assert_eq!(store.default_key().unwrap(), store.key(b"a").unwrap());
        let mut out = [0u8; 16];
        let n = store
            .lookup_credential(CredentialKind::Key, None, &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"k2");

        assert!(matches!(store.set_default_key(b"k1"), Err(Error::UnknownKey)));
        store.set_default_key(b"k2").unwrap();
    }

    #[test]
    fn test_rekeying_other_default_follows() {
        let mut store = SecurityStore::new();
        store.add_identity("a", "k1").unwrap();
        store.add_identity("b", "k2").unwrap();
        store.set_default_key(b"k2").unwrap();
        store.add_identity("b", "k9").unwrap();

        assert_eq!(store.default_identity().unwrap(), b"a");
        assert_eq!(store.default_key().unwrap(), b"k9");
    }

    #[test]
    fn test_set_default_identity() {
        let mut store = SecurityStore::new();
        store.add_identity("foo", "bar").unwrap();
        store.add_identity("bar", "foo").unwrap();

        store.set_default_identity(b"bar").unwrap();
        assert_eq!(store.default_identity().unwrap(), b"bar");
        assert!(matches!(
            store.set_default_identity(b"baz"),
            Err(Error::UnknownIdentity)
        ));
    }

    #[test]
    fn test_set_default_key() {
        let mut store = SecurityStore::new();
        store.add_identity("foo", "bar").unwrap();
        store.add_identity("bar", "foo").unwrap();

        store.set_default_key(b"foo").unwrap();
        assert_eq!(store.default_key().unwrap(), b"foo");
        assert!(matches!(store.set_default_key(b"nope"), Err(Error::UnknownKey)));
    }

    #[test]
    fn test_set_defaults_is_atomic() {
        let mut store = SecurityStore::new();
        store.add_identity("foo", "bar").unwrap();
        store.add_identity("bar", "foo").unwrap();

        assert!(store.set_defaults(b"bar", b"missing").is_err());
        assert_eq!(store.default_identity().unwrap(), b"foo");

        store.set_defaults(b"bar", b"foo").unwrap();
        assert_eq!(store.default_identity().unwrap(), b"bar");
        assert_eq!(store.default_key().unwrap(), b"foo");
    }

    #[test]
    fn test_add_key_uses_empty_identity() {
        let mut store = SecurityStore::new();
        store.add_key("secret").unwrap();
        assert_eq!(store.key(b""), Some(&b"secret"[..]));
        assert_eq!(store.default_identity().unwrap(), b"");
    }

    #[test]
    fn test_lookup_key_by_hint_and_default() {
        let mut store = SecurityStore::new();
        store.add_identity("foo", "bar").unwrap();
        store.add_identity("baz", "qux").unwrap();
        let mut out = [0u8; 16];

        let n = store
            .lookup_credential(CredentialKind::Key, Some(b"baz"), &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"qux");

        let n = store
            .lookup_credential(CredentialKind::Key, None, &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"bar");
    }

    #[test]
    fn test_lookup_missing_key() {
        let mut store = SecurityStore::new();
        let mut out = [0u8; 16];
        assert_eq!(
            store.lookup_credential(CredentialKind::Key, None, &mut out),
            Err(AlertDescription::DecryptError)
        );

        store.add_identity("foo", "bar").unwrap();
        assert_eq!(
            store.lookup_credential(CredentialKind::Key, Some(b"nobody"), &mut out),
            Err(AlertDescription::DecryptError)
        );
    }

    #[test]
    fn test_lookup_key_too_long() {
        let mut store = SecurityStore::new();
        store.add_identity("foo", "a-much-longer-key").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(
            store.lookup_credential(CredentialKind::Key, None, &mut out),
            Err(AlertDescription::InternalError)
        );
    }

    #[test]
    fn test_lookup_identity_and_hint() {
        let mut store = SecurityStore::new();
        store.add_identity("client", "key").unwrap();
        let mut out = [0u8; 16];

        let n = store
            .lookup_credential(CredentialKind::Identity, None, &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"client");

        assert_eq!(
            store.lookup_credential(CredentialKind::Hint, None, &mut out),
            Ok(0)
        );
    }
}
