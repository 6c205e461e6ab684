//! root key storage
//!
//! Macaroons are minted against root keys that stay on the service side;
//! only an opaque id goes into the macaroon. Keys must remain available for
//! as long as any macaroon referencing them is valid. Reuse is fine and some
//! rotation over time is advisable; the store decides.

use std::sync::Mutex;

use rand::RngCore;

use crate::context::Context;
use crate::error::Error;

/// storage for macaroon root keys
pub trait RootKeyStore: Send + Sync {
    /// Returns the root key for the given id, or [`Error::NotFound`] if
    /// there is none.
    fn get(&self, ctx: &Context, id: &[u8]) -> Result<Vec<u8>, Error>;

    /// Returns the root key to mint a new macaroon with, along with an id
    /// that can later be passed to `get` to retrieve it.
    fn root_key(&self, ctx: &Context) -> Result<(Vec<u8>, Vec<u8>), Error>;
}

/// An in-memory store generating a single key on first use, always returned
/// under the id `"0"`.
#[derive(Debug, Default)]
pub struct MemRootKeyStore {
    key: Mutex<Option<Vec<u8>>>,
}

impl MemRootKeyStore {
    pub fn new() -> Self {
        MemRootKeyStore::default()
    }
}

impl RootKeyStore for MemRootKeyStore {
    fn get(&self, _ctx: &Context, id: &[u8]) -> Result<Vec<u8>, Error> {
        let key = self.key.lock().expect("root key mutex poisoned");
        match key.as_ref() {
            Some(key) if id == b"0" => Ok(key.clone()),
            _ => Err(Error::NotFound),
        }
    }

    fn root_key(&self, _ctx: &Context) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let mut key = self.key.lock().expect("root key mutex poisoned");
        let key = key.get_or_insert_with(|| {
            let mut new_key = vec![0u8; 24];
            rand::rngs::OsRng.fill_bytes(&mut new_key);
            new_key
        });
        Ok((key.clone(), b"0".to_vec()))
    }
}
