// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM used by the integration tests
//!
//! `MockTpm` implements the subset of TPM 2.0 the orchestrator drives:
//! hierarchies with passwords, primary and ordinary objects, wrapped object
//! blobs, policy sessions, NV indices, PCRs and quotes. Key material is
//! derived with SHA-256 and HMAC instead of real RSA/ECC/AES arithmetic, so
//! results are deterministic where the TPM's would be and every wire format
//! matches the real command.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tpm2_app::*;
use tracing_subscriber::EnvFilter;

pub const PERSISTENT_FIRST: u32 = 0x8100_0000;
const TRANSIENT_FIRST: u32 = 0x8000_0000;
const SESSION_FIRST: u32 = 0x0300_0000;
const PCR_COUNT: usize = 24;
const RSA_MODULUS_BYTES: usize = 256;
/// The simulator hands out at most this many random bytes per call
/// TPML_DIGEST capacity
pub const MAX_PCR_READ_DIGESTS: usize = 8;
pub const MAX_RANDOM_PER_CALL: usize = 32;
pub const REVISION: u32 = 146;
pub const MANUFACTURER: u32 = u32::from_be_bytes(*b"IBM ");
const COMMAND_SIZE: ResponseCode = ResponseCode(0x142);

type HmacSha256 = Hmac<Sha256>;
type Handled = Result<Reply, ResponseCode>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A started orchestrator over a fresh mock
pub fn new_app() -> App<TctiAdapter<MockTpm>> {
    init_tracing();
    let mut app = App::with_engine(MockTpm::new());
    app.startup().expect("startup");
    app
}

pub fn mock(app: &App<TctiAdapter<MockTpm>>) -> &MockTpm {
    app.tcti().engine()
}

pub fn mock_mut(app: &mut App<TctiAdapter<MockTpm>>) -> &mut MockTpm {
    app.tcti_mut().engine_mut()
}

fn sha256(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Keystream of `len` bytes bound to `key` and `label`
fn expand(key: &[u8], label: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter = 0u32;
    while out.len() < len {
        counter += 1;
        out.extend(sha256(&[label.as_bytes(), key, &counter.to_be_bytes()]));
    }
    out.truncate(len);
    out
}

fn xor(data: &[u8], stream: &[u8]) -> Vec<u8> {
    data.iter().zip(stream).map(|(a, b)| a ^ b).collect()
}

fn sha256_name(public_area: &[u8]) -> Vec<u8> {
    let mut name = TpmAlgId::Sha256.to_u16().to_be_bytes().to_vec();
    name.extend(sha256(&[public_area]));
    name
}

/// Maps a codec error on parameter `n` to the TPM's size error
trait ParamExt<T> {
    fn param(self, n: u32) -> Result<T, ResponseCode>;
}

impl<T> ParamExt<T> for anyhow::Result<T> {
    fn param(self, n: u32) -> Result<T, ResponseCode> {
        self.map_err(|_| ResponseCode::SIZE.with_parameter(n))
    }
}

/// Outer wrapper produced by a duplication authority for `import`
pub struct DuplicationBlob {
    pub integrity_hmac: Vec<u8>,
    pub encrypted_private: Vec<u8>,
    pub encrypted_seed: Vec<u8>,
}

/// Wrap `object` for import under an RSA parent with public modulus `n`.
///
/// The seed is protected with a keystream derived from the parent's public
/// key and the private part with a KDFa-derived keystream standing in for
/// AES-CFB; the integrity HMAC follows the TPM's outer wrapper.
pub fn duplicate(parent: &PublicKey, object: &ExternalKeyedHash, seed: &[u8; 32]) -> DuplicationBlob {
    let PublicKey::Rsa { n } = parent else {
        panic!("duplication needs an RSA parent");
    };
    let name = object.encoded_name();
    let sym_key = kdfa(TpmAlgId::Sha256, seed, "STORAGE", &name, &[], 128);
    let hmac_key = kdfa(TpmAlgId::Sha256, seed, "INTEGRITY", &[], &[], 256);

    let private = object.encoded_private();
    let encrypted_private = xor(&private, &expand(&sym_key, "cfb", private.len()));
    DuplicationBlob {
        integrity_hmac: hmac(&hmac_key, &[&encrypted_private, &name]),
        encrypted_private,
        encrypted_seed: xor(seed, &expand(n, "seed", seed.len())),
    }
}

#[derive(Debug, Clone)]
struct MockObject {
    public: TpmtPublic,
    public_area: Vec<u8>,
    name: Vec<u8>,
    qualified_name: Vec<u8>,
    hierarchy: u32,
    secret: Vec<u8>,
    auth: Vec<u8>,
    sensitive: Vec<u8>,
}

impl MockObject {
    fn has(&self, bits: u32) -> bool {
        self.public.object_attributes.contains(bits)
    }

    fn is_storage_parent(&self) -> bool {
        self.has(TpmaObject::RESTRICTED | TpmaObject::DECRYPT) && !self.has(TpmaObject::SIGN_ENCRYPT)
    }

    fn is_signing_key(&self) -> bool {
        matches!(self.public.type_alg, TpmAlgId::Rsa | TpmAlgId::Ecc)
            && self.has(TpmaObject::SIGN_ENCRYPT)
    }

    fn rsa_modulus(&self) -> Option<&[u8]> {
        match &self.public.unique {
            TpmtPublicUnique::Rsa(n) => Some(n),
            _ => None,
        }
    }

    fn signature(&self, digest: &[u8]) -> TpmtSignature {
        match self.public.type_alg {
            TpmAlgId::Rsa => TpmtSignature::Rsa {
                scheme: TpmAlgId::RsaSsa,
                hash_alg: TpmAlgId::Sha256,
                sig: expand(&hmac(&self.secret, &[b"sig", digest]), "rsassa", RSA_MODULUS_BYTES),
            },
            _ => TpmtSignature::Ecc {
                scheme: TpmAlgId::EcDsa,
                hash_alg: TpmAlgId::Sha256,
                r: hmac(&self.secret, &[b"r", digest]),
                s: hmac(&self.secret, &[b"s", digest]),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct MockSession {
    trial: bool,
    digest: Vec<u8>,
    check_password: bool,
}

impl MockSession {
    fn new(trial: bool) -> Self {
        Self {
            trial,
            digest: vec![0; 32],
            check_password: false,
        }
    }

    fn extend(&mut self, parts: &[&[u8]]) {
        let mut all: Vec<&[u8]> = vec![self.digest.as_slice()];
        all.extend_from_slice(parts);
        self.digest = sha256(&all);
    }
}

#[derive(Debug, Clone)]
struct MockNv {
    public: TpmsNvPublic,
    auth: Vec<u8>,
    data: Vec<u8>,
    written: bool,
}

impl MockNv {
    fn current_public(&self) -> TpmsNvPublic {
        let mut public = self.public.clone();
        if self.written {
            public.attributes = TpmaNv(public.attributes.0 | TpmaNv::WRITTEN);
        }
        public
    }

    fn name(&self) -> Vec<u8> {
        sha256_name(&self.current_public().to_bytes())
    }
}

struct AuthSlot {
    handle: u32,
    attributes: u8,
    hmac: Vec<u8>,
}

/// What an entity accepts as authorization
struct EntityAuth {
    auth: Vec<u8>,
    policy: Vec<u8>,
    user_with_auth: bool,
    lockout_protected: bool,
}

struct Request<'a> {
    handles: Vec<u32>,
    params: ResponseBuffer<'a>,
}

#[derive(Default)]
struct Reply {
    handle: Option<u32>,
    params: Vec<u8>,
}

impl Reply {
    fn empty() -> Self {
        Self::default()
    }

    fn params(buf: CommandBuffer) -> Self {
        Self {
            handle: None,
            params: buf.into_vec(),
        }
    }

    fn with_handle(handle: u32, buf: CommandBuffer) -> Self {
        Self {
            handle: Some(handle),
            params: buf.into_vec(),
        }
    }
}

/// Handles in the handle area, and how many of them need authorization
fn handle_layout(cc: TpmCc) -> Option<(usize, usize)> {
    use TpmCc::*;
    Some(match cc {
        Startup | Shutdown | SelfTest | GetRandom | GetCapability | TestParms | PCR_Read
        | FlushContext => (0, 0),
        StartAuthSession => (2, 0),
        ReadPublic | VerifySignature | RSA_Encrypt | NV_ReadPublic | PolicyPassword
        | PolicyPCR | PolicyGetDigest => (1, 0),
        Clear | PCR_Extend | CreatePrimary | Create | Load | Sign | EncryptDecrypt
        | RSA_Decrypt | NV_DefineSpace | Quote | HierarchyChangeAuth | Unseal
        | DictionaryAttackLockReset | Import => (1, 1),
        EvictControl | NV_Write | NV_Read | PolicySecret => (2, 1),
        _ => return None,
    })
}

/// Software TPM state
pub struct MockTpm {
    started: bool,
    boot_count: u32,
    proof: Vec<u8>,
    owner_epoch: u32,
    hierarchy_auth: HashMap<u32, Vec<u8>>,
    objects: BTreeMap<u32, MockObject>,
    sessions: BTreeMap<u32, MockSession>,
    nv: BTreeMap<u32, MockNv>,
    pcrs: Vec<Vec<u8>>,
    pcr_update_counter: u32,
    next_transient: u32,
    next_session: u32,
    rng_counter: u64,
    clock: u64,
    da_failures: u32,
    history: Vec<TpmCc>,
}

impl Default for MockTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTpm {
    /// A powered-on TPM that still needs TPM2_Startup
    pub fn new() -> Self {
        Self {
            started: false,
            boot_count: 0,
            proof: sha256(&[b"mock tpm proof"]),
            owner_epoch: 0,
            hierarchy_auth: HashMap::new(),
            objects: BTreeMap::new(),
            sessions: BTreeMap::new(),
            nv: BTreeMap::new(),
            pcrs: vec![vec![0; 32]; PCR_COUNT],
            pcr_update_counter: 0,
            next_transient: TRANSIENT_FIRST,
            next_session: SESSION_FIRST,
            rng_counter: 0,
            clock: 0,
            da_failures: 0,
            history: Vec::new(),
        }
    }

    /// Power off and on again: transient state is lost, persistent objects
    /// and NV survive, and the TPM waits for TPM2_Startup.
    pub fn power_cycle(&mut self) {
        self.started = false;
        self.objects.retain(|&h, _| h >= PERSISTENT_FIRST);
        self.sessions.clear();
        self.pcrs = vec![vec![0; 32]; PCR_COUNT];
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn boot_count(&self) -> u32 {
        self.boot_count
    }

    pub fn pcr(&self, index: usize) -> &[u8] {
        &self.pcrs[index]
    }

    pub fn owner_seed(&self) -> Vec<u8> {
        self.hierarchy_seed(tpm_rh::OWNER)
    }

    pub fn da_failures(&self) -> u32 {
        self.da_failures
    }

    pub fn history(&self) -> &[TpmCc] {
        &self.history
    }

    pub fn count_of(&self, cc: TpmCc) -> usize {
        self.history.iter().filter(|&&c| c == cc).count()
    }

    pub fn has_object(&self, handle: u32) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn has_session(&self, handle: u32) -> bool {
        self.sessions.contains_key(&handle)
    }

    fn hierarchy_seed(&self, hierarchy: u32) -> Vec<u8> {
        let epoch = if hierarchy == tpm_rh::OWNER {
            self.owner_epoch
        } else {
            0
        };
        hmac(
            &self.proof,
            &[b"hierarchy", &hierarchy.to_be_bytes(), &epoch.to_be_bytes()],
        )
    }

    fn random(&mut self, len: usize) -> Vec<u8> {
        self.rng_counter += 1;
        expand(&self.proof, &format!("random {}", self.rng_counter), len)
    }

    fn alloc_transient(&mut self) -> u32 {
        let handle = self.next_transient;
        self.next_transient += 1;
        handle
    }

    fn object(&self, handle: u32, n: u32) -> Result<&MockObject, ResponseCode> {
        self.objects
            .get(&handle)
            .ok_or(ResponseCode::HANDLE.with_handle(n))
    }

    fn session_mut(&mut self, handle: u32) -> Result<&mut MockSession, ResponseCode> {
        self.sessions
            .get_mut(&handle)
            .ok_or(ResponseCode::HANDLE.with_handle(1))
    }

    fn selected_pcr_digest(&self, selection: &TpmlPcrSelection) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for sel in &selection.pcr_selections {
            if sel.hash == TpmAlgId::Sha256 {
                for pcr in sel.pcrs().filter(|&p| (p as usize) < PCR_COUNT) {
                    hasher.update(&self.pcrs[pcr as usize]);
                }
            }
        }
        hasher.finalize().to_vec()
    }

    fn entity_name(&self, handle: u32) -> Vec<u8> {
        match self.objects.get(&handle) {
            Some(obj) => obj.name.clone(),
            None => handle.to_be_bytes().to_vec(),
        }
    }

    fn entity_auth(&self, handle: u32, n: u32) -> Result<EntityAuth, ResponseCode> {
        match handle {
            tpm_rh::OWNER | tpm_rh::ENDORSEMENT | tpm_rh::PLATFORM | tpm_rh::LOCKOUT
            | tpm_rh::NULL => Ok(EntityAuth {
                auth: self.hierarchy_auth.get(&handle).cloned().unwrap_or_default(),
                policy: Vec::new(),
                user_with_auth: true,
                lockout_protected: false,
            }),
            h if (h as usize) < PCR_COUNT => Ok(EntityAuth {
                auth: Vec::new(),
                policy: Vec::new(),
                user_with_auth: true,
                lockout_protected: false,
            }),
            h => {
                if let Some(obj) = self.objects.get(&h) {
                    return Ok(EntityAuth {
                        auth: obj.auth.clone(),
                        policy: obj.public.auth_policy.buffer.clone(),
                        user_with_auth: obj.has(TpmaObject::USER_WITH_AUTH),
                        lockout_protected: !obj.has(TpmaObject::NO_DA),
                    });
                }
                if let Some(nv) = self.nv.get(&h) {
                    return Ok(EntityAuth {
                        auth: nv.auth.clone(),
                        policy: Vec::new(),
                        user_with_auth: true,
                        lockout_protected: false,
                    });
                }
                Err(ResponseCode::HANDLE.with_handle(n))
            }
        }
    }

    fn authorize(&mut self, handle: u32, slot: &AuthSlot, n: u32) -> Result<(), ResponseCode> {
        let entity = self.entity_auth(handle, n)?;
        let wrong_password = if entity.lockout_protected {
            ResponseCode::AUTH_FAIL.with_session(n)
        } else {
            ResponseCode::BAD_AUTH.with_session(n)
        };

        if slot.handle == tpm_rh::PW {
            if !entity.user_with_auth {
                return Err(ResponseCode::AUTH_UNAVAILABLE);
            }
            if slot.hmac != entity.auth {
                if entity.lockout_protected {
                    self.da_failures += 1;
                }
                return Err(wrong_password);
            }
            return Ok(());
        }

        let session = self
            .sessions
            .get(&slot.handle)
            .ok_or(ResponseCode::VALUE.with_session(n))?;
        if session.trial {
            return Err(ResponseCode::ATTRIBUTES.with_session(n));
        }
        if entity.policy.is_empty() || session.digest != entity.policy {
            return Err(ResponseCode::POLICY_FAIL.with_session(n));
        }
        if session.check_password && slot.hmac != entity.auth {
            if entity.lockout_protected {
                self.da_failures += 1;
            }
            return Err(wrong_password);
        }

        if slot.attributes & TpmaSa::CONTINUE_SESSION != 0 {
            // policy sessions start over after every authorization
            if let Some(session) = self.sessions.get_mut(&slot.handle) {
                *session = MockSession::new(false);
            }
        } else {
            self.sessions.remove(&slot.handle);
        }
        Ok(())
    }

    fn dispatch(&mut self, command: &[u8]) -> (bool, usize, Handled) {
        let mut buf = ResponseBuffer::new(command);
        let header = (|| -> anyhow::Result<(u16, u32, u32)> {
            Ok((buf.get_u16()?, buf.get_u32()?, buf.get_u32()?))
        })();
        let Ok((tag, size, code)) = header else {
            return (false, 0, Err(COMMAND_SIZE));
        };
        if size as usize != command.len() {
            return (false, 0, Err(COMMAND_SIZE));
        }
        let with_sessions = tag == TpmSt::Sessions.to_u16();

        let Some(cc) = TpmCc::from_u32(code) else {
            return (false, 0, Err(ResponseCode::COMMAND_CODE));
        };
        self.history.push(cc);
        if !self.started && cc != TpmCc::Startup {
            return (false, 0, Err(ResponseCode::INITIALIZE));
        }
        let Some((handle_count, auth_count)) = handle_layout(cc) else {
            return (false, 0, Err(ResponseCode::COMMAND_CODE));
        };

        let mut handles = Vec::with_capacity(handle_count);
        for _ in 0..handle_count {
            match buf.get_u32() {
                Ok(h) => handles.push(h),
                Err(_) => return (false, 0, Err(COMMAND_SIZE)),
            }
        }

        let mut auths = Vec::new();
        if with_sessions {
            match parse_auth_area(&mut buf) {
                Ok(slots) => auths = slots,
                Err(_) => return (false, 0, Err(ResponseCode::AUTH_MISSING)),
            }
        }
        if auths.len() < auth_count {
            return (false, 0, Err(ResponseCode::AUTH_MISSING));
        }
        for (i, slot) in auths.iter().take(auth_count).enumerate() {
            if let Err(rc) = self.authorize(handles[i], slot, i as u32 + 1) {
                return (false, 0, Err(rc));
            }
        }

        let req = Request {
            handles,
            params: buf,
        };
        let result = self.run(cc, req);
        (with_sessions, auths.len(), result)
    }

    fn run(&mut self, cc: TpmCc, req: Request) -> Handled {
        use TpmCc::*;
        match cc {
            Startup => self.startup(req),
            Shutdown => Ok(Reply::empty()),
            SelfTest => Ok(Reply::empty()),
            Clear => self.clear(),
            GetRandom => self.get_random(req),
            GetCapability => self.get_capability(req),
            TestParms => self.test_parms(req),
            PCR_Extend => self.pcr_extend(req),
            PCR_Read => self.pcr_read(req),
            CreatePrimary => self.create_primary(req),
            Create => self.create(req),
            Load => self.load(req),
            ReadPublic => self.read_public(req),
            FlushContext => self.flush_context(req),
            EvictControl => self.evict_control(req),
            Sign => self.sign(req),
            VerifySignature => self.verify_signature(req),
            EncryptDecrypt => self.encrypt_decrypt(req),
            RSA_Encrypt => self.rsa_encrypt(req),
            RSA_Decrypt => self.rsa_decrypt(req),
            NV_DefineSpace => self.nv_define_space(req),
            NV_Write => self.nv_write(req),
            NV_Read => self.nv_read(req),
            NV_ReadPublic => self.nv_read_public(req),
            Quote => self.quote(req),
            HierarchyChangeAuth => self.hierarchy_change_auth(req),
            Unseal => self.unseal(req),
            DictionaryAttackLockReset => {
                self.da_failures = 0;
                Ok(Reply::empty())
            }
            Import => self.import(req),
            StartAuthSession => self.start_auth_session(req),
            PolicyPassword => self.policy_password(req),
            PolicyPCR => self.policy_pcr(req),
            PolicySecret => self.policy_secret(req),
            PolicyGetDigest => self.policy_get_digest(req),
            _ => Err(ResponseCode::COMMAND_CODE),
        }
    }

    // ==================== Housekeeping ====================

    fn startup(&mut self, mut req: Request) -> Handled {
        let _su = req.params.get_u16().param(1)?;
        if self.started {
            return Err(ResponseCode::INITIALIZE);
        }
        self.started = true;
        self.boot_count += 1;
        Ok(Reply::empty())
    }

    fn clear(&mut self) -> Handled {
        self.owner_epoch += 1;
        for h in [tpm_rh::OWNER, tpm_rh::ENDORSEMENT, tpm_rh::LOCKOUT] {
            self.hierarchy_auth.remove(&h);
        }
        self.objects
            .retain(|_, obj| obj.hierarchy == tpm_rh::PLATFORM || obj.hierarchy == tpm_rh::NULL);
        self.nv
            .retain(|_, nv| nv.public.attributes.contains(TpmaNv::PLATFORM_CREATE));
        Ok(Reply::empty())
    }

    fn get_random(&mut self, mut req: Request) -> Handled {
        let requested = req.params.get_u16().param(1)? as usize;
        let bytes = self.random(requested.min(MAX_RANDOM_PER_CALL));
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&bytes);
        Ok(Reply::params(out))
    }

    fn get_capability(&mut self, mut req: Request) -> Handled {
        let capability = req.params.get_u32().param(1)?;
        let property = req.params.get_u32().param(2)?;
        let count = req.params.get_u32().param(3)? as usize;

        let mut out = CommandBuffer::new();
        if capability != TpmCap::TpmProperties as u32 {
            out.put_u8(TPM_NO);
            out.put_u32(capability);
            out.put_u32(0);
            return Ok(Reply::params(out));
        }

        let table = [
            (tpm_pt::FAMILY_INDICATOR, u32::from_be_bytes(*b"2.0\0")),
            (tpm_pt::LEVEL, 0),
            (tpm_pt::REVISION, REVISION),
            (tpm_pt::DAY_OF_YEAR, 1),
            (tpm_pt::YEAR, 2018),
            (tpm_pt::MANUFACTURER, MANUFACTURER),
        ];
        let matching: Vec<_> = table.iter().filter(|(p, _)| *p >= property).collect();
        let returned = &matching[..count.min(matching.len())];

        out.put_u8(if returned.len() < matching.len() { TPM_YES } else { TPM_NO });
        out.put_u32(capability);
        out.put_u32(returned.len() as u32);
        for (p, v) in returned {
            out.put_u32(*p);
            out.put_u32(*v);
        }
        Ok(Reply::params(out))
    }

    fn test_parms(&mut self, mut req: Request) -> Handled {
        let p = &mut req.params;
        let type_alg = TpmAlgId::from_u16(p.get_u16().param(1)?);
        match type_alg {
            Some(TpmAlgId::KeyedHash) => {
                let scheme = TpmAlgId::from_u16(p.get_u16().param(1)?);
                match scheme {
                    Some(TpmAlgId::Null) => {}
                    Some(TpmAlgId::Hmac) | Some(TpmAlgId::Xor) => {
                        let hash = TpmAlgId::from_u16(p.get_u16().param(1)?);
                        if !matches!(
                            hash,
                            Some(TpmAlgId::Sha1 | TpmAlgId::Sha256 | TpmAlgId::Sha384)
                        ) {
                            return Err(ResponseCode::HASH.with_parameter(1));
                        }
                    }
                    _ => return Err(ResponseCode::SCHEME.with_parameter(1)),
                }
            }
            Some(TpmAlgId::Rsa) => {
                let parms = TpmsRsaParms::unmarshal(p).param(1)?;
                if !matches!(parms.key_bits, 1024 | 2048) {
                    return Err(ResponseCode::KEY_SIZE.with_parameter(1));
                }
            }
            Some(TpmAlgId::Ecc) => {
                let parms = TpmsEccParms::unmarshal(p).param(1)?;
                if parms.curve_id != TpmEccCurve::NistP256 {
                    return Err(ResponseCode::VALUE.with_parameter(1));
                }
            }
            Some(TpmAlgId::SymCipher) => {
                let sym = TpmtSymDef::unmarshal(p).param(1)?;
                if sym.algorithm != TpmAlgId::Aes || !matches!(sym.key_bits, 128 | 256) {
                    return Err(ResponseCode::KEY_SIZE.with_parameter(1));
                }
            }
            _ => return Err(ResponseCode::VALUE.with_parameter(1)),
        }
        Ok(Reply::empty())
    }

    // ==================== PCRs ====================

    fn pcr_extend(&mut self, mut req: Request) -> Handled {
        let pcr = req.handles[0] as usize;
        if pcr >= PCR_COUNT {
            return Err(ResponseCode::VALUE.with_handle(1));
        }
        let count = req.params.get_u32().param(1)?;
        for _ in 0..count {
            let ha = TpmtHa::unmarshal(&mut req.params).param(1)?;
            if ha.hash_alg == TpmAlgId::Sha256 {
                self.pcrs[pcr] = sha256(&[&self.pcrs[pcr], &ha.digest]);
            }
        }
        self.pcr_update_counter += 1;
        Ok(Reply::empty())
    }

    fn pcr_read(&mut self, mut req: Request) -> Handled {
        let selection = TpmlPcrSelection::unmarshal(&mut req.params).param(1)?;

        // pcrSelectionOut only names the PCRs that fit in the TPML_DIGEST
        let mut selected = Vec::new();
        let mut digests = Vec::new();
        for sel in &selection.pcr_selections {
            let mut returned = TpmsPcrSelection {
                hash: sel.hash,
                pcr_select: vec![0; sel.pcr_select.len()],
            };
            if sel.hash == TpmAlgId::Sha256 {
                for pcr in sel.pcrs().filter(|&p| (p as usize) < PCR_COUNT) {
                    if digests.len() == MAX_PCR_READ_DIGESTS {
                        break;
                    }
                    digests.push(self.pcrs[pcr as usize].clone());
                    returned.pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
                }
            }
            selected.push(returned);
        }

        let mut out = CommandBuffer::new();
        out.put_u32(self.pcr_update_counter);
        TpmlPcrSelection::new(selected).marshal(&mut out);
        out.put_u32(digests.len() as u32);
        for d in &digests {
            out.put_tpm2b(d);
        }
        Ok(Reply::params(out))
    }

    // ==================== Objects ====================

    fn read_template(&self, p: &mut ResponseBuffer) -> Result<(TpmtPublic, Vec<u8>, Vec<u8>), ResponseCode> {
        let mut sensitive = p.get_sized().param(1)?;
        let auth = sensitive.get_tpm2b().param(1)?;
        let data = sensitive.get_tpm2b().param(1)?;
        let public = Tpm2bPublic::unmarshal(p).param(2)?.decode().param(2)?;
        let _outside_info = p.get_tpm2b().param(3)?;
        let _creation_pcr = TpmlPcrSelection::unmarshal(p).param(4)?;

        let attrs = public.object_attributes;
        if public.name_alg != TpmAlgId::Sha256 {
            return Err(ResponseCode::HASH.with_parameter(2));
        }
        if attrs.contains(TpmaObject::RESTRICTED | TpmaObject::DECRYPT | TpmaObject::SIGN_ENCRYPT)
        {
            return Err(ResponseCode::ATTRIBUTES.with_parameter(2));
        }
        if !data.is_empty()
            && (attrs.contains(TpmaObject::SENSITIVE_DATA_ORIGIN)
                || attrs.0 & (TpmaObject::DECRYPT | TpmaObject::SIGN_ENCRYPT) != 0)
        {
            return Err(ResponseCode::ATTRIBUTES.with_parameter(2));
        }
        if let TpmtPublicParms::Rsa(rsa) = &public.parameters {
            if rsa.key_bits != 2048 {
                return Err(ResponseCode::KEY_SIZE.with_parameter(2));
            }
        }
        Ok((public, auth, data))
    }

    /// Fill in the unique field from the secret and build the object.
    fn instantiate(
        &self,
        mut public: TpmtPublic,
        secret: Vec<u8>,
        auth: Vec<u8>,
        sensitive: Vec<u8>,
        hierarchy: u32,
        parent_qualified_name: &[u8],
    ) -> MockObject {
        public.unique = match public.type_alg {
            TpmAlgId::Rsa => TpmtPublicUnique::Rsa(expand(&secret, "rsa", RSA_MODULUS_BYTES)),
            TpmAlgId::Ecc => TpmtPublicUnique::Ecc(
                sha256(&[b"ecc-x", &secret]),
                sha256(&[b"ecc-y", &secret]),
            ),
            TpmAlgId::SymCipher => TpmtPublicUnique::SymCipher(sha256(&[&secret, &sensitive])),
            _ => TpmtPublicUnique::KeyedHash(sha256(&[&secret, &sensitive])),
        };
        let public_area = public.to_bytes();
        let name = sha256_name(&public_area);
        let qualified_name = sha256_name(&[parent_qualified_name, &name].concat());
        MockObject {
            public,
            public_area,
            name,
            qualified_name,
            hierarchy,
            secret,
            auth,
            sensitive,
        }
    }

    fn creation_reply(
        &self,
        out: &mut CommandBuffer,
        hierarchy: u32,
        parent_name_alg: TpmAlgId,
        parent_name: &[u8],
        parent_qualified_name: &[u8],
    ) {
        let mut creation = CommandBuffer::new();
        creation.put_u32(0); // pcrSelect
        creation.put_tpm2b(&sha256(&[]));
        creation.put_u8(0); // locality
        creation.put_u16(parent_name_alg.to_u16());
        creation.put_tpm2b(parent_name);
        creation.put_tpm2b(parent_qualified_name);
        creation.put_tpm2b_empty(); // outsideInfo
        let creation = creation.into_vec();
        let creation_hash = sha256(&[&creation]);

        out.put_tpm2b(&creation);
        out.put_tpm2b(&creation_hash);
        TpmtTicket {
            tag: TpmSt::Creation.to_u16(),
            hierarchy,
            digest: hmac(&self.proof, &[&creation_hash]),
        }
        .marshal(out);
    }

    fn create_primary(&mut self, mut req: Request) -> Handled {
        let hierarchy = req.handles[0];
        if Hierarchy::from_handle(hierarchy).is_none() {
            return Err(ResponseCode::HIERARCHY.with_handle(1));
        }
        let (template, auth, data) = self.read_template(&mut req.params)?;

        let secret = hmac(
            &self.hierarchy_seed(hierarchy),
            &[&template.to_bytes(), &auth, &data],
        );
        let hierarchy_name = hierarchy.to_be_bytes();
        let obj = self.instantiate(template, secret, auth, data, hierarchy, &hierarchy_name);

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&obj.public_area);
        self.creation_reply(&mut out, hierarchy, TpmAlgId::Null, &hierarchy_name, &hierarchy_name);
        out.put_tpm2b(&obj.name);

        let handle = self.alloc_transient();
        self.objects.insert(handle, obj);
        Ok(Reply::with_handle(handle, out))
    }

    /// Protect an object's private part under `parent`: integrity HMAC
    /// followed by the encrypted secret, auth and sensitive data.
    fn wrap(&self, parent: &MockObject, obj: &MockObject) -> Vec<u8> {
        let key = hmac(&self.proof, &[b"storage", &parent.secret]);
        let mut payload = CommandBuffer::new();
        payload.put_tpm2b(&obj.secret);
        payload.put_tpm2b(&obj.auth);
        payload.put_tpm2b(&obj.sensitive);
        let payload = payload.into_vec();

        let encrypted = xor(&payload, &expand(&key, "blob", payload.len()));
        let mut blob = hmac(&key, &[&encrypted, &obj.name]);
        blob.extend(encrypted);
        blob
    }

    fn unwrap_private(
        &self,
        parent: &MockObject,
        blob: &[u8],
        name: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), ResponseCode> {
        let integrity_error = ResponseCode::INTEGRITY.with_parameter(1);
        if blob.len() < 32 {
            return Err(integrity_error);
        }
        let key = hmac(&self.proof, &[b"storage", &parent.secret]);
        let (mac, encrypted) = blob.split_at(32);
        if hmac(&key, &[encrypted, name]) != mac {
            return Err(integrity_error);
        }
        let payload = xor(encrypted, &expand(&key, "blob", encrypted.len()));
        let mut p = ResponseBuffer::new(&payload);
        Ok((
            p.get_tpm2b().param(1)?,
            p.get_tpm2b().param(1)?,
            p.get_tpm2b().param(1)?,
        ))
    }

    fn create(&mut self, mut req: Request) -> Handled {
        let parent = self.object(req.handles[0], 1)?.clone();
        if !parent.is_storage_parent() {
            return Err(ResponseCode::TYPE.with_handle(1));
        }
        let (template, auth, data) = self.read_template(&mut req.params)?;

        let secret = self.random(32);
        let obj = self.instantiate(
            template,
            secret,
            auth,
            data,
            parent.hierarchy,
            &parent.qualified_name,
        );

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&self.wrap(&parent, &obj));
        out.put_tpm2b(&obj.public_area);
        self.creation_reply(
            &mut out,
            parent.hierarchy,
            TpmAlgId::Sha256,
            &parent.name,
            &parent.qualified_name,
        );
        Ok(Reply::params(out))
    }

    fn load(&mut self, mut req: Request) -> Handled {
        let parent = self.object(req.handles[0], 1)?.clone();
        if !parent.is_storage_parent() {
            return Err(ResponseCode::TYPE.with_handle(1));
        }
        let blob = req.params.get_tpm2b().param(1)?;
        let public_area = req.params.get_tpm2b().param(2)?;
        let public = Tpm2bPublic {
            public_area: public_area.clone(),
        }
        .decode()
        .param(2)?;
        let name = sha256_name(&public_area);
        let (secret, auth, sensitive) = self.unwrap_private(&parent, &blob, &name)?;

        let obj = MockObject {
            public,
            public_area,
            qualified_name: sha256_name(&[parent.qualified_name.as_slice(), &name].concat()),
            name: name.clone(),
            hierarchy: parent.hierarchy,
            secret,
            auth,
            sensitive,
        };
        let handle = self.alloc_transient();
        self.objects.insert(handle, obj);

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&name);
        Ok(Reply::with_handle(handle, out))
    }

    fn read_public(&mut self, req: Request) -> Handled {
        let obj = self.object(req.handles[0], 1)?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&obj.public_area);
        out.put_tpm2b(&obj.name);
        out.put_tpm2b(&obj.qualified_name);
        Ok(Reply::params(out))
    }

    fn flush_context(&mut self, mut req: Request) -> Handled {
        let handle = req.params.get_u32().param(1)?;
        let flushed = match TpmHt::of(handle) {
            Some(TpmHt::Transient) => self.objects.remove(&handle).is_some(),
            Some(TpmHt::PolicySession | TpmHt::HmacSession) => {
                self.sessions.remove(&handle).is_some()
            }
            _ => false,
        };
        if !flushed {
            return Err(ResponseCode::HANDLE.with_parameter(1));
        }
        Ok(Reply::empty())
    }

    fn evict_control(&mut self, mut req: Request) -> Handled {
        let object = req.handles[1];
        let persistent = req.params.get_u32().param(1)?;
        if persistent < PERSISTENT_FIRST {
            return Err(ResponseCode::VALUE.with_parameter(1));
        }

        if object >= PERSISTENT_FIRST {
            if object != persistent || self.objects.remove(&object).is_none() {
                return Err(ResponseCode::HANDLE.with_handle(2));
            }
            return Ok(Reply::empty());
        }

        let obj = self.object(object, 2)?.clone();
        if self.objects.contains_key(&persistent) {
            return Err(ResponseCode::NV_DEFINED);
        }
        self.objects.insert(persistent, obj);
        Ok(Reply::empty())
    }

    fn hierarchy_change_auth(&mut self, mut req: Request) -> Handled {
        let new_auth = req.params.get_tpm2b().param(1)?;
        if new_auth.len() > 32 {
            return Err(ResponseCode::SIZE.with_parameter(1));
        }
        self.hierarchy_auth.insert(req.handles[0], new_auth);
        Ok(Reply::empty())
    }

    fn unseal(&mut self, req: Request) -> Handled {
        let obj = self.object(req.handles[0], 1)?;
        if obj.public.type_alg != TpmAlgId::KeyedHash {
            return Err(ResponseCode::TYPE.with_handle(1));
        }
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&obj.sensitive);
        Ok(Reply::params(out))
    }

    fn import(&mut self, mut req: Request) -> Handled {
        let parent = self.object(req.handles[0], 1)?.clone();
        if !parent.is_storage_parent() {
            return Err(ResponseCode::TYPE.with_handle(1));
        }
        let Some(n) = parent.rsa_modulus() else {
            return Err(ResponseCode::TYPE.with_handle(1));
        };

        let p = &mut req.params;
        if !p.get_tpm2b().param(1)?.is_empty() {
            return Err(ResponseCode::SIZE.with_parameter(1));
        }
        let public_area = p.get_tpm2b().param(2)?;
        let public = Tpm2bPublic {
            public_area: public_area.clone(),
        }
        .decode()
        .param(2)?;
        let duplicate = p.get_tpm2b().param(3)?;
        let encrypted_seed = p.get_tpm2b().param(4)?;
        let _symmetric = TpmtSymDef::unmarshal(p).param(5)?;

        let name = sha256_name(&public_area);
        let seed = xor(&encrypted_seed, &expand(n, "seed", encrypted_seed.len()));
        if seed.is_empty() {
            return Err(ResponseCode::VALUE.with_parameter(4));
        }

        let mut dup = ResponseBuffer::new(&duplicate);
        let integrity = dup.get_tpm2b().param(3)?;
        let encrypted = dup.get_remaining();
        let hmac_key = kdfa(TpmAlgId::Sha256, &seed, "INTEGRITY", &[], &[], 256);
        if hmac(&hmac_key, &[&encrypted, &name]) != integrity {
            return Err(ResponseCode::INTEGRITY.with_parameter(3));
        }

        let sym_key = kdfa(TpmAlgId::Sha256, &seed, "STORAGE", &name, &[], 128);
        let plain = xor(&encrypted, &expand(&sym_key, "cfb", encrypted.len()));
        let mut sensitive = ResponseBuffer::new(&plain);
        let mut area = sensitive.get_sized().param(3)?;
        let sensitive_type = area.get_u16().param(3)?;
        let auth = area.get_tpm2b().param(3)?;
        let seed_value = area.get_tpm2b().param(3)?;
        let bits = area.get_tpm2b().param(3)?;
        if sensitive_type != public.type_alg.to_u16() {
            return Err(ResponseCode::TYPE.with_parameter(3));
        }
        if public.unique != TpmtPublicUnique::KeyedHash(sha256(&[&seed_value, &bits])) {
            return Err(ResponseCode::BINDING.with_parameter(2));
        }

        let obj = MockObject {
            public,
            public_area,
            qualified_name: sha256_name(&[parent.qualified_name.as_slice(), &name].concat()),
            name,
            hierarchy: parent.hierarchy,
            secret: seed_value,
            auth,
            sensitive: bits,
        };
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&self.wrap(&parent, &obj));
        Ok(Reply::params(out))
    }

    // ==================== Signing / Encryption ====================

    fn sign(&mut self, mut req: Request) -> Handled {
        let key = self.object(req.handles[0], 1)?;
        if !key.is_signing_key() {
            return Err(ResponseCode::KEY.with_handle(1));
        }
        let digest = req.params.get_tpm2b().param(1)?;
        let scheme = TpmtScheme::unmarshal(&mut req.params).param(2)?;
        let ticket = TpmtTicket::unmarshal(&mut req.params).param(3)?;

        if key.has(TpmaObject::RESTRICTED) && ticket.hierarchy == tpm_rh::NULL {
            return Err(ResponseCode::TICKET.with_parameter(3));
        }
        let key_scheme = match &key.public.parameters {
            TpmtPublicParms::Rsa(p) => p.scheme.scheme,
            TpmtPublicParms::Ecc(p) => p.scheme.scheme,
            _ => TpmAlgId::Null,
        };
        if (key_scheme != TpmAlgId::Null && scheme.scheme != TpmAlgId::Null && key_scheme != scheme.scheme)
            || (key_scheme == TpmAlgId::Null && scheme.scheme == TpmAlgId::Null)
        {
            return Err(ResponseCode::SCHEME.with_parameter(2));
        }

        let mut out = CommandBuffer::new();
        key.signature(&digest).marshal(&mut out);
        Ok(Reply::params(out))
    }

    fn verify_signature(&mut self, mut req: Request) -> Handled {
        let key = self.object(req.handles[0], 1)?;
        if !key.is_signing_key() {
            return Err(ResponseCode::KEY.with_handle(1));
        }
        let digest = req.params.get_tpm2b().param(1)?;
        let signature = TpmtSignature::unmarshal(&mut req.params).param(2)?;
        if signature != key.signature(&digest) {
            return Err(ResponseCode::SIGNATURE.with_parameter(2));
        }

        let mut out = CommandBuffer::new();
        TpmtTicket {
            tag: TpmSt::Verified.to_u16(),
            hierarchy: key.hierarchy,
            digest: hmac(&self.proof, &[&digest, &key.name]),
        }
        .marshal(&mut out);
        Ok(Reply::params(out))
    }

    fn encrypt_decrypt(&mut self, mut req: Request) -> Handled {
        let key = self.object(req.handles[0], 1)?;
        if key.public.type_alg != TpmAlgId::SymCipher {
            return Err(ResponseCode::KEY.with_handle(1));
        }
        let p = &mut req.params;
        let decrypt = p.get_u8().param(1)? == TPM_YES;
        let _mode = p.get_u16().param(2)?;
        let iv = p.get_tpm2b().param(3)?;
        let data = p.get_tpm2b().param(4)?;

        let required = if decrypt {
            TpmaObject::DECRYPT
        } else {
            TpmaObject::SIGN_ENCRYPT
        };
        if key.has(TpmaObject::RESTRICTED) || !key.has(required) {
            return Err(ResponseCode::ATTRIBUTES.with_handle(1));
        }

        let stream = expand(&[key.secret.as_slice(), &iv].concat(), "sym", data.len());
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&xor(&data, &stream));
        out.put_tpm2b(&iv);
        Ok(Reply::params(out))
    }

    fn rsa_encrypt(&mut self, mut req: Request) -> Handled {
        let key = self.object(req.handles[0], 1)?;
        let Some(n) = key.rsa_modulus().map(<[u8]>::to_vec) else {
            return Err(ResponseCode::KEY.with_handle(1));
        };
        if !key.has(TpmaObject::DECRYPT) {
            return Err(ResponseCode::ATTRIBUTES.with_handle(1));
        }
        let message = req.params.get_tpm2b().param(1)?;
        let _scheme = TpmtScheme::unmarshal(&mut req.params).param(2)?;
        let _label = req.params.get_tpm2b().param(3)?;
        if message.len() > RSA_MODULUS_BYTES - 11 {
            return Err(ResponseCode::VALUE.with_parameter(1));
        }

        let mut plain = vec![0x00, 0x02];
        plain.extend(self.random(8));
        plain.extend((message.len() as u16).to_be_bytes());
        plain.extend(&message);
        plain.resize(RSA_MODULUS_BYTES, 0);

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&xor(&plain, &expand(&n, "rsaes", RSA_MODULUS_BYTES)));
        Ok(Reply::params(out))
    }

    fn rsa_decrypt(&mut self, mut req: Request) -> Handled {
        let key = self.object(req.handles[0], 1)?;
        let Some(n) = key.rsa_modulus() else {
            return Err(ResponseCode::KEY.with_handle(1));
        };
        if key.has(TpmaObject::RESTRICTED) || !key.has(TpmaObject::DECRYPT) {
            return Err(ResponseCode::ATTRIBUTES.with_handle(1));
        }
        let ciphertext = req.params.get_tpm2b().param(1)?;
        let _scheme = TpmtScheme::unmarshal(&mut req.params).param(2)?;
        let _label = req.params.get_tpm2b().param(3)?;
        if ciphertext.len() != RSA_MODULUS_BYTES {
            return Err(ResponseCode::SIZE.with_parameter(1));
        }

        let plain = xor(&ciphertext, &expand(n, "rsaes", RSA_MODULUS_BYTES));
        let len = u16::from_be_bytes([plain[10], plain[11]]) as usize;
        if plain[..2] != [0x00, 0x02] || 12 + len > plain.len() {
            return Err(ResponseCode::VALUE.with_parameter(1));
        }
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&plain[12..12 + len]);
        Ok(Reply::params(out))
    }

    // ==================== Attestation ====================

    fn quote(&mut self, mut req: Request) -> Handled {
        let key = self.object(req.handles[0], 1)?.clone();
        if !key.is_signing_key() {
            return Err(ResponseCode::KEY.with_handle(1));
        }
        let nonce = req.params.get_tpm2b().param(1)?;
        let _scheme = TpmtScheme::unmarshal(&mut req.params).param(2)?;
        let selection = TpmlPcrSelection::unmarshal(&mut req.params).param(3)?;

        self.clock += 1;
        let mut attest = CommandBuffer::new();
        attest.put_u32(TPM_GENERATED_VALUE);
        attest.put_u16(TpmSt::AttestQuote.to_u16());
        attest.put_tpm2b(&key.qualified_name);
        attest.put_tpm2b(&nonce);
        attest.put_u64(self.clock);
        attest.put_u32(0); // resetCount
        attest.put_u32(self.boot_count); // restartCount
        attest.put_u8(TPM_YES); // safe
        attest.put_u64(0x2001_0000_0000_0000);
        selection.marshal(&mut attest);
        attest.put_tpm2b(&self.selected_pcr_digest(&selection));
        let attest = attest.into_vec();

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&attest);
        key.signature(&sha256(&[&attest])).marshal(&mut out);
        Ok(Reply::params(out))
    }

    // ==================== NV ====================

    fn nv_index(&self, handle: u32, n: u32) -> Result<&MockNv, ResponseCode> {
        self.nv.get(&handle).ok_or(ResponseCode::HANDLE.with_handle(n))
    }

    fn nv_define_space(&mut self, mut req: Request) -> Handled {
        let auth = req.params.get_tpm2b().param(1)?;
        let public = Tpm2bNvPublic::unmarshal(&mut req.params).param(2)?.nv_public;
        if TpmHt::of(public.nv_index) != Some(TpmHt::NvIndex) {
            return Err(ResponseCode::HANDLE.with_parameter(2));
        }
        if self.nv.contains_key(&public.nv_index) {
            return Err(ResponseCode::NV_DEFINED);
        }
        if public.data_size as usize > 2048 {
            return Err(ResponseCode::SIZE.with_parameter(2));
        }
        self.nv.insert(
            public.nv_index,
            MockNv {
                data: vec![0xFF; public.data_size as usize],
                public,
                auth,
                written: false,
            },
        );
        Ok(Reply::empty())
    }

    fn nv_read_public(&mut self, req: Request) -> Handled {
        let nv = self.nv_index(req.handles[0], 1)?;
        let mut out = CommandBuffer::new();
        Tpm2bNvPublic {
            nv_public: nv.current_public(),
        }
        .marshal(&mut out);
        out.put_tpm2b(&nv.name());
        Ok(Reply::params(out))
    }

    fn nv_write(&mut self, mut req: Request) -> Handled {
        let index = req.handles[1];
        let data = req.params.get_tpm2b().param(1)?;
        let offset = req.params.get_u16().param(2)? as usize;

        let Some(nv) = self.nv.get_mut(&index) else {
            return Err(ResponseCode::HANDLE.with_handle(2));
        };
        if offset + data.len() > nv.data.len() {
            return Err(ResponseCode::NV_RANGE);
        }
        nv.data[offset..offset + data.len()].copy_from_slice(&data);
        nv.written = true;
        Ok(Reply::empty())
    }

    fn nv_read(&mut self, mut req: Request) -> Handled {
        let size = req.params.get_u16().param(1)? as usize;
        let offset = req.params.get_u16().param(2)? as usize;
        let nv = self.nv_index(req.handles[1], 2)?;
        if !nv.written {
            return Err(ResponseCode::NV_UNINITIALIZED);
        }
        if offset + size > nv.data.len() {
            return Err(ResponseCode::NV_RANGE);
        }
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&nv.data[offset..offset + size]);
        Ok(Reply::params(out))
    }

    // ==================== Sessions ====================

    fn start_auth_session(&mut self, mut req: Request) -> Handled {
        if req.handles != [tpm_rh::NULL, tpm_rh::NULL] {
            return Err(ResponseCode::VALUE.with_handle(1));
        }
        let p = &mut req.params;
        let _nonce_caller = p.get_tpm2b().param(1)?;
        let _salt = p.get_tpm2b().param(2)?;
        let session_type = TpmSe::from_u8(p.get_u8().param(3)?);
        let _symmetric = TpmtSymDef::unmarshal(p).param(4)?;
        let auth_hash = p.get_u16().param(5)?;

        let trial = match session_type {
            Some(TpmSe::Trial) => true,
            Some(TpmSe::Policy) => false,
            _ => return Err(ResponseCode::VALUE.with_parameter(3)),
        };
        if auth_hash != TpmAlgId::Sha256.to_u16() {
            return Err(ResponseCode::HASH.with_parameter(5));
        }

        let handle = self.next_session;
        self.next_session += 1;
        self.sessions.insert(handle, MockSession::new(trial));

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&self.random(32));
        Ok(Reply::with_handle(handle, out))
    }

    fn policy_password(&mut self, req: Request) -> Handled {
        let session = self.session_mut(req.handles[0])?;
        session.extend(&[&TpmCc::PolicyAuthValue.to_u32().to_be_bytes()]);
        session.check_password = true;
        Ok(Reply::empty())
    }

    fn policy_pcr(&mut self, mut req: Request) -> Handled {
        let pcr_digest = req.params.get_tpm2b().param(1)?;
        let selection = TpmlPcrSelection::unmarshal(&mut req.params).param(2)?;
        let current = self.selected_pcr_digest(&selection);

        let session = self.session_mut(req.handles[0])?;
        let asserted = if pcr_digest.is_empty() {
            current
        } else {
            if !session.trial && pcr_digest != current {
                return Err(ResponseCode::VALUE.with_parameter(1));
            }
            pcr_digest
        };
        session.extend(&[
            &TpmCc::PolicyPCR.to_u32().to_be_bytes(),
            &selection.to_bytes(),
            &asserted,
        ]);
        Ok(Reply::empty())
    }

    fn policy_secret(&mut self, mut req: Request) -> Handled {
        let _nonce_tpm = req.params.get_tpm2b().param(1)?;
        let _cp_hash = req.params.get_tpm2b().param(2)?;
        let policy_ref = req.params.get_tpm2b().param(3)?;
        let _expiration = req.params.get_u32().param(4)?;

        let auth_name = self.entity_name(req.handles[0]);
        let session = self.session_mut(req.handles[1])?;
        session.extend(&[&TpmCc::PolicySecret.to_u32().to_be_bytes(), &auth_name]);
        session.extend(&[&policy_ref]);

        let mut out = CommandBuffer::new();
        out.put_tpm2b_empty(); // timeout
        TpmtTicket::null(TpmSt::AuthSecret).marshal(&mut out);
        Ok(Reply::params(out))
    }

    fn policy_get_digest(&mut self, req: Request) -> Handled {
        let session = self.session_mut(req.handles[0])?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&session.digest);
        Ok(Reply::params(out))
    }
}

fn parse_auth_area(buf: &mut ResponseBuffer) -> anyhow::Result<Vec<AuthSlot>> {
    let size = buf.get_u32()? as usize;
    let mut area = buf.sub_buffer(size)?;
    let mut slots = Vec::new();
    while area.remaining() > 0 {
        let handle = area.get_u32()?;
        let _nonce = area.get_tpm2b()?;
        let attributes = area.get_u8()?;
        let hmac = area.get_tpm2b()?;
        slots.push(AuthSlot {
            handle,
            attributes,
            hmac,
        });
    }
    Ok(slots)
}

fn encode_response(with_sessions: bool, auth_count: usize, result: Handled) -> Vec<u8> {
    let mut out = CommandBuffer::new();
    let reply = match result {
        Ok(reply) => reply,
        Err(rc) => {
            out.put_u16(TpmSt::NoSessions.to_u16());
            out.put_u32(HEADER_SIZE as u32);
            out.put_u32(rc.0);
            return out.into_vec();
        }
    };

    let tag = if with_sessions {
        TpmSt::Sessions
    } else {
        TpmSt::NoSessions
    };
    out.put_u16(tag.to_u16());
    out.put_u32(0);
    out.put_u32(0);
    if let Some(handle) = reply.handle {
        out.put_u32(handle);
    }
    if with_sessions {
        out.put_u32(reply.params.len() as u32);
    }
    out.put_bytes(&reply.params);
    if with_sessions {
        for _ in 0..auth_count {
            out.put_tpm2b_empty(); // nonceTPM
            out.put_u8(TpmaSa::CONTINUE_SESSION);
            out.put_tpm2b_empty(); // hmac
        }
    }
    let size = out.len() as u32;
    out.update_u32(2, size);
    out.into_vec()
}

impl Engine for MockTpm {
    fn execute_command(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        let (with_sessions, auth_count, result) = self.dispatch(command);
        Ok(encode_response(with_sessions, auth_count, result))
    }
}

/// Engine whose transport always fails
pub struct BrokenEngine;

impl Engine for BrokenEngine {
    fn execute_command(&mut self, _command: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("device unplugged")
    }
}
