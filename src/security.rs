//! Seed/key protection of the XCP resources.
//!
//! Every protected resource is either locked, waiting for the key of an issued seed,
//! or unlocked. A seed is good for exactly one key attempt: a wrong key locks the
//! resource again and a new seed must be requested.

use std::ffi::OsStr;
use std::fmt;

use anyhow::Result;
use rand::Rng;

use crate::constants::resources;
use crate::protocol::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    CalPag,
    Daq,
    Stim,
    Pgm,
}

impl Resource {
    pub const ALL: [Resource; 4] = [Resource::CalPag, Resource::Daq, Resource::Stim, Resource::Pgm];

    pub fn bit(self) -> u8 {
        match self {
            Resource::CalPag => resources::CALPAG,
            Resource::Daq => resources::DAQ,
            Resource::Stim => resources::STIM,
            Resource::Pgm => resources::PGM,
        }
    }

    /// The resource if exactly one known bit is set.
    pub fn from_bits(bits: u8) -> Option<Self> {
        Resource::ALL.into_iter().find(|r| r.bit() == bits)
    }

    fn index(self) -> usize {
        match self {
            Resource::CalPag => 0,
            Resource::Daq => 1,
            Resource::Stim => 2,
            Resource::Pgm => 3,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::CalPag => "CAL_PAG",
            Resource::Daq => "DAQ",
            Resource::Stim => "STIM",
            Resource::Pgm => "PGM",
        };
        f.write_str(name)
    }
}

bitfield::bitfield! {
    /// Resource bits as used in CONNECT, GET_STATUS and UNLOCK.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceMask(u8);
    impl Debug;
    pub calpag, set_calpag: 0;
    pub daq, set_daq: 2;
    pub stim, set_stim: 3;
    pub pgm, set_pgm: 4;
}

impl ResourceMask {
    pub fn from_bits(bits: u8) -> Self {
        ResourceMask(bits & (resources::CALPAG | resources::DAQ | resources::STIM | resources::PGM))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, resource: Resource) -> bool {
        self.0 & resource.bit() != 0
    }

    pub fn insert(&mut self, resource: Resource) {
        self.0 |= resource.bit();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SecurityState {
    #[default]
    Locked,
    /// `sent` bytes of `seed` were transmitted so far
    SeedIssued { seed: Vec<u8>, sent: usize },
    Unlocked,
}

/// Seed generation and key verification on the target.
pub trait SeedKey {
    fn seed(&mut self, resource: Resource) -> Vec<u8>;
    fn verify(&mut self, resource: Resource, seed: &[u8], key: &[u8]) -> bool;
}

/// Key computation on the host.
pub trait KeyAlgorithm {
    fn compute_key(&mut self, resource: Resource, seed: &[u8]) -> Result<Vec<u8>>;
}

/// The example algorithm of the reference seed/key library: constant seeds, the
/// PGM key is seed - 1, the CAL_PAG key is seed + 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct DemoKey;

impl DemoKey {
    fn key_for(resource: Resource, seed: &[u8]) -> Option<Vec<u8>> {
        match resource {
            Resource::Pgm => Some(seed.iter().map(|b| b.wrapping_sub(1)).collect()),
            Resource::CalPag => Some(seed.iter().map(|b| b.wrapping_add(1)).collect()),
            _ => None,
        }
    }
}

impl SeedKey for DemoKey {
    fn seed(&mut self, resource: Resource) -> Vec<u8> {
        match resource {
            Resource::CalPag => vec![0xaa],
            _ => vec![0x55],
        }
    }

    fn verify(&mut self, resource: Resource, seed: &[u8], key: &[u8]) -> bool {
        DemoKey::key_for(resource, seed).is_some_and(|expected| expected == key)
    }
}

impl KeyAlgorithm for DemoKey {
    fn compute_key(&mut self, resource: Resource, seed: &[u8]) -> Result<Vec<u8>> {
        DemoKey::key_for(resource, seed)
            .ok_or_else(|| anyhow::format_err!("no demo key for resource {}", resource))
    }
}

/// Random seeds, the key is the seed XORed with a shared secret.
#[derive(Debug, Clone)]
pub struct SecretKey {
    secret: Vec<u8>,
    seed_len: usize,
}

impl SecretKey {
    pub fn new(secret: &[u8], seed_len: usize) -> Result<Self> {
        anyhow::ensure!(!secret.is_empty(), "secret must not be empty");
        anyhow::ensure!((1..=255).contains(&seed_len), "seed length must be within 1..=255");
        Ok(SecretKey {
            secret: secret.to_vec(),
            seed_len,
        })
    }

    /// Secret given as a hex string.
    pub fn from_hex(secret: &str, seed_len: usize) -> Result<Self> {
        Self::new(&hex::decode(secret.trim())?, seed_len)
    }

    fn key_for(&self, resource: Resource, seed: &[u8]) -> Vec<u8> {
        seed.iter()
            .zip(self.secret.iter().cycle())
            .map(|(s, k)| s ^ k ^ resource.bit())
            .collect()
    }
}

impl SeedKey for SecretKey {
    fn seed(&mut self, _resource: Resource) -> Vec<u8> {
        let mut rng = rand::rng();
        (0..self.seed_len).map(|_| rng.random::<u8>()).collect()
    }

    fn verify(&mut self, resource: Resource, seed: &[u8], key: &[u8]) -> bool {
        self.key_for(resource, seed) == key
    }
}

impl KeyAlgorithm for SecretKey {
    fn compute_key(&mut self, resource: Resource, seed: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key_for(resource, seed))
    }
}

const COMPUTE_KEY: &[u8] = b"XCP_ComputeKeyFromSeed\0";
const GET_PRIVILEGES: &[u8] = b"XCP_GetAvailablePrivileges\0";

type ComputeKeyFn = unsafe extern "C" fn(u8, u8, *const u8, *mut u8, *mut u8) -> u32;
type GetPrivilegesFn = unsafe extern "C" fn(*mut u8) -> u32;

/// Seed/key shared library exporting `XCP_ComputeKeyFromSeed` and
/// `XCP_GetAvailablePrivileges`.
pub struct LibraryKey {
    lib: libloading::Library,
}

impl LibraryKey {
    pub fn load<P: AsRef<OsStr>>(path: P) -> Result<Self> {
        // Safety: loading runs the library's initializers, the user picked the library.
        let lib = unsafe { libloading::Library::new(path.as_ref())? };
        unsafe {
            lib.get::<ComputeKeyFn>(COMPUTE_KEY)?;
        }
        log::debug!("Loaded seed/key library {:?}", path.as_ref());
        Ok(LibraryKey { lib })
    }

    /// Resources the library can compute keys for.
    pub fn available_privileges(&self) -> Result<ResourceMask> {
        let get: libloading::Symbol<GetPrivilegesFn> =
            unsafe { self.lib.get(GET_PRIVILEGES)? };
        let mut privileges = 0u8;
        let rc = unsafe { get(&mut privileges) };
        anyhow::ensure!(rc == 0, "XCP_GetAvailablePrivileges failed with {}", rc);
        Ok(ResourceMask::from_bits(privileges))
    }
}

impl KeyAlgorithm for LibraryKey {
    fn compute_key(&mut self, resource: Resource, seed: &[u8]) -> Result<Vec<u8>> {
        anyhow::ensure!(
            !seed.is_empty() && seed.len() <= 0xff,
            "invalid seed length {}",
            seed.len()
        );
        let compute: libloading::Symbol<ComputeKeyFn> =
            unsafe { self.lib.get(COMPUTE_KEY)? };
        let mut key = [0u8; 0xff];
        let mut key_len = key.len() as u8;
        let rc = unsafe {
            compute(
                resource.bit(),
                seed.len() as u8,
                seed.as_ptr(),
                &mut key_len,
                key.as_mut_ptr(),
            )
        };
        anyhow::ensure!(rc == 0, "XCP_ComputeKeyFromSeed failed with {}", rc);
        Ok(key[..key_len as usize].to_vec())
    }
}

/// Per-resource protection state of one session.
pub struct Security {
    seed_key: Box<dyn SeedKey>,
    available: ResourceMask,
    protected: bool,
    states: [SecurityState; 4],
}

impl Security {
    /// `available` are the resources of this bootloader. Without protection they are
    /// always unlocked.
    pub fn new(available: ResourceMask, protected: bool, seed_key: Box<dyn SeedKey>) -> Self {
        let mut security = Security {
            seed_key,
            available,
            protected,
            states: Default::default(),
        };
        security.reset();
        security
    }

    /// Locks every protected resource, done on CONNECT and DISCONNECT.
    pub fn reset(&mut self) {
        for r in Resource::ALL {
            self.states[r.index()] = if self.protected && self.available.contains(r) {
                SecurityState::Locked
            } else {
                SecurityState::Unlocked
            };
        }
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn state(&self, resource: Resource) -> &SecurityState {
        &self.states[resource.index()]
    }

    pub fn is_unlocked(&self, resource: Resource) -> bool {
        self.states[resource.index()] == SecurityState::Unlocked
    }

    /// Resources that are not unlocked.
    pub fn protection(&self) -> ResourceMask {
        let mut mask = ResourceMask::default();
        for r in Resource::ALL {
            if self.available.contains(r) && !self.is_unlocked(r) {
                mask.insert(r);
            }
        }
        mask
    }

    /// GET_SEED. Returns the remaining seed length and the next part of the seed,
    /// at most `max_part` bytes.
    pub fn get_seed(
        &mut self,
        mode: u8,
        resource_bits: u8,
        max_part: usize,
    ) -> Result<(u8, Vec<u8>), ErrorCode> {
        let resource = Resource::from_bits(resource_bits)
            .filter(|r| self.available.contains(*r))
            .ok_or(ErrorCode::OutOfRange)?;
        let index = resource.index();

        let issue = match (mode, &self.states[index]) {
            (0, SecurityState::Unlocked) => return Ok((0, Vec::new())),
            (0, SecurityState::Locked) => true,
            (1, SecurityState::SeedIssued { seed, sent }) if *sent < seed.len() => false,
            (0 | 1, _) => return Err(ErrorCode::Sequence),
            _ => return Err(ErrorCode::OutOfRange),
        };
        if issue {
            let seed = self.seed_key.seed(resource);
            if seed.is_empty() || seed.len() > 0xff {
                log::warn!("seed of {} bytes for {} is unusable", seed.len(), resource);
                return Err(ErrorCode::Generic);
            }
            // one pending seed at a time
            for state in self.states.iter_mut() {
                if matches!(state, SecurityState::SeedIssued { .. }) {
                    *state = SecurityState::Locked;
                }
            }
            self.states[index] = SecurityState::SeedIssued { seed, sent: 0 };
        }

        match &mut self.states[index] {
            SecurityState::SeedIssued { seed, sent } => {
                let remaining = seed.len() - *sent;
                let part = remaining.min(max_part);
                let chunk = seed[*sent..*sent + part].to_vec();
                *sent += part;
                log::debug!("seed for {}: {} of {} bytes", resource, part, remaining);
                Ok((remaining as u8, chunk))
            }
            _ => Err(ErrorCode::Generic),
        }
    }

    /// UNLOCK with a complete key. Returns the protection status afterwards.
    pub fn unlock(&mut self, key: &[u8]) -> Result<ResourceMask, ErrorCode> {
        let Some(resource) = Resource::ALL
            .into_iter()
            .find(|r| matches!(self.states[r.index()], SecurityState::SeedIssued { .. }))
        else {
            return Err(ErrorCode::AccessLocked);
        };
        let state = std::mem::replace(&mut self.states[resource.index()], SecurityState::Locked);
        let SecurityState::SeedIssued { seed, sent } = state else {
            return Err(ErrorCode::AccessLocked);
        };
        if sent < seed.len() {
            log::debug!("unlock before the whole seed was requested");
            return Err(ErrorCode::Sequence);
        }
        if !self.seed_key.verify(resource, &seed, key) {
            log::warn!("invalid key for {}", resource);
            return Err(ErrorCode::AccessLocked);
        }
        self.states[resource.index()] = SecurityState::Unlocked;
        log::info!("{} unlocked", resource);
        Ok(self.protection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgm_and_cal() -> ResourceMask {
        ResourceMask::from_bits(resources::PGM | resources::CALPAG)
    }

    #[test]
    fn resource_bits() {
        assert_eq!(Resource::from_bits(0x10), Some(Resource::Pgm));
        assert_eq!(Resource::from_bits(0x11), None);
        assert_eq!(Resource::from_bits(0x02), None);
        let mask = pgm_and_cal();
        assert!(mask.pgm() && mask.calpag() && !mask.daq());
    }

    #[test]
    fn unprotected_resources_are_unlocked() {
        let security = Security::new(pgm_and_cal(), false, Box::new(DemoKey));
        assert!(security.is_unlocked(Resource::Pgm));
        assert_eq!(security.protection().bits(), 0);
    }

    #[test]
    fn demo_key_unlocks() {
        let mut security = Security::new(pgm_and_cal(), true, Box::new(DemoKey));
        assert_eq!(security.protection().bits(), 0x11);

        let (len, seed) = security.get_seed(0, resources::PGM, 62).unwrap();
        assert_eq!((len, seed.as_slice()), (1, &[0x55][..]));
        let key = DemoKey.compute_key(Resource::Pgm, &seed).unwrap();
        assert_eq!(security.unlock(&key).unwrap().bits(), resources::CALPAG);
        assert!(security.is_unlocked(Resource::Pgm));

        // already unlocked gives an empty seed
        assert_eq!(security.get_seed(0, resources::PGM, 62).unwrap(), (0, vec![]));
    }

    #[test]
    fn wrong_key_relocks_and_seed_is_single_use() {
        let mut security = Security::new(pgm_and_cal(), true, Box::new(DemoKey));
        security.get_seed(0, resources::PGM, 62).unwrap();
        assert_eq!(security.unlock(&[0x00]), Err(ErrorCode::AccessLocked));
        assert_eq!(security.state(Resource::Pgm), &SecurityState::Locked);
        // the correct key does not help without a new seed
        assert_eq!(security.unlock(&[0x54]), Err(ErrorCode::AccessLocked));
        assert!(!security.is_unlocked(Resource::Pgm));
    }

    #[test]
    fn seed_requests_are_validated() {
        let mut security = Security::new(
            ResourceMask::from_bits(resources::PGM),
            true,
            Box::new(DemoKey),
        );
        assert_eq!(security.get_seed(0, 0x11, 62), Err(ErrorCode::OutOfRange));
        assert_eq!(security.get_seed(0, resources::CALPAG, 62), Err(ErrorCode::OutOfRange));
        assert_eq!(security.get_seed(1, resources::PGM, 62), Err(ErrorCode::Sequence));
        security.get_seed(0, resources::PGM, 62).unwrap();
        assert_eq!(security.get_seed(0, resources::PGM, 62), Err(ErrorCode::Sequence));
        assert_eq!(security.get_seed(7, resources::PGM, 62), Err(ErrorCode::OutOfRange));
    }

    #[test]
    fn long_seed_is_sent_in_parts() {
        let secret = SecretKey::new(&[0x12, 0x34], 10).unwrap();
        let mut security = Security::new(
            ResourceMask::from_bits(resources::PGM),
            true,
            Box::new(secret.clone()),
        );
        let (remaining, first) = security.get_seed(0, resources::PGM, 6).unwrap();
        assert_eq!((remaining, first.len()), (10, 6));
        let (remaining, second) = security.get_seed(1, resources::PGM, 6).unwrap();
        assert_eq!((remaining, second.len()), (4, 4));
        assert_eq!(security.get_seed(1, resources::PGM, 6), Err(ErrorCode::Sequence));

        let seed = [first, second].concat();
        let key = secret.clone().compute_key(Resource::Pgm, &seed).unwrap();
        assert!(security.unlock(&key).is_ok());
    }

    #[test]
    fn unlock_before_seed_complete_is_a_sequence_error() {
        let secret = SecretKey::new(&[0xa5], 4).unwrap();
        let mut security = Security::new(
            ResourceMask::from_bits(resources::PGM),
            true,
            Box::new(secret),
        );
        security.get_seed(0, resources::PGM, 2).unwrap();
        assert_eq!(security.unlock(&[0; 4]), Err(ErrorCode::Sequence));
        assert_eq!(security.state(Resource::Pgm), &SecurityState::Locked);
    }

    #[test]
    fn secret_key_from_hex() {
        assert!(SecretKey::from_hex("00ff", 4).is_ok());
        assert!(SecretKey::from_hex("", 4).is_err());
        assert!(SecretKey::from_hex("0g", 4).is_err());
        assert!(SecretKey::new(&[1], 0).is_err());
    }
}
