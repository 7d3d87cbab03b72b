//! Root CA generation/persistence and on-demand per-host leaf cert minting.
//!
//! A self-signed root held as an `rcgen::CertificateParams` + `KeyPair`, with per-SNI leaves
//! signed on demand and memoized behind a single-flight mint lock.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::CaError;

const LEAF_CACHE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct CertifiedKey {
	pub cert_pem: String,
	pub key_pem: String,
	pub not_after: OffsetDateTime,
}

struct LeafCache {
	capacity: usize,
	entries: HashMap<String, CertifiedKey>,
	/// Most-recently-used at the back.
	recency: VecDeque<String>,
}

impl LeafCache {
	fn new(capacity: usize) -> Self {
		LeafCache { capacity, entries: HashMap::new(), recency: VecDeque::new() }
	}

	fn touch(&mut self, host: &str) {
		if let Some(pos) = self.recency.iter().position(|h| h == host) {
			self.recency.remove(pos);
		}
		self.recency.push_back(host.to_string());
	}

	fn get(&mut self, host: &str, now: OffsetDateTime) -> Option<CertifiedKey> {
		let entry = self.entries.get(host)?;
		if entry.not_after <= now {
			self.entries.remove(host);
			self.recency.retain(|h| h != host);
			return None;
		}
		let entry = entry.clone();
		self.touch(host);
		Some(entry)
	}

	fn insert(&mut self, host: String, key: CertifiedKey) {
		if !self.entries.contains_key(&host) && self.entries.len() >= self.capacity {
			if let Some(evicted) = self.recency.pop_front() {
				self.entries.remove(&evicted);
			}
		}
		self.touch(&host);
		self.entries.insert(host, key);
	}

	fn len(&self) -> usize {
		self.entries.len()
	}
}

/// Generates/persists the root CA and mints per-host leaf certificates on demand, memoized with
/// per-host single-flight coalescing so concurrent mints for the same host share one signer call.
pub struct CaStore {
	root_cert_pem: String,
	root_key: KeyPair,
	root_params: CertificateParams,
	leaf_ttl: TimeDuration,
	cache: AsyncMutex<LeafCache>,
	/// One lock per host in flight; dropped once the mint completes.
	inflight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CaStore {
	/// Loads the root CA from `dir` if present, otherwise generates and persists one
	/// (key file written with mode 0600 on unix, per spec §6 "Persisted state").
	pub fn load_or_generate(dir: &Path, leaf_ttl_days: i64) -> Result<Self, CaError> {
		std::fs::create_dir_all(dir)?;
		let cert_path = dir.join("ca-cert.pem");
		let key_path = dir.join("ca-key.pem");

		let (root_key, root_cert_pem, root_params) = if cert_path.exists() && key_path.exists() {
			let key_pem = std::fs::read_to_string(&key_path)?;
			let cert_pem = std::fs::read_to_string(&cert_path)?;
			let key = KeyPair::from_pem(&key_pem).map_err(|e| CaError::RootGeneration(e.to_string()))?;
			let params = root_params_from_existing()?;
			info!(dir = %dir.display(), "loaded existing root CA");
			(key, cert_pem, params)
		} else {
			let key = KeyPair::generate().map_err(|e| CaError::RootGeneration(e.to_string()))?;
			let params = root_params_from_existing()?;
			let cert = params
				.clone()
				.self_signed(&key)
				.map_err(|e| CaError::RootGeneration(e.to_string()))?;
			let cert_pem = cert.pem();
			std::fs::write(&cert_path, &cert_pem)?;
			write_private(&key_path, &key.serialize_pem())?;
			info!(dir = %dir.display(), "generated new root CA");
			(key, cert_pem, params)
		};

		Ok(CaStore {
			root_cert_pem,
			root_key,
			root_params,
			leaf_ttl: TimeDuration::days(leaf_ttl_days),
			cache: AsyncMutex::new(LeafCache::new(LEAF_CACHE_CAPACITY)),
			inflight: AsyncMutex::new(HashMap::new()),
		})
	}

	/// The root certificate in PEM, exposed read-only for operator installation.
	pub fn root_cert_pem(&self) -> &str {
		&self.root_cert_pem
	}

	pub async fn cached_leaf_count(&self) -> usize {
		self.cache.lock().await.len()
	}

	/// Mints (or returns a cached) leaf certificate for `host`, SAN = `{host}`.
	pub async fn leaf_for_host(&self, host: &str) -> Result<CertifiedKey, CaError> {
		let now = OffsetDateTime::now_utc();
		if let Some(hit) = self.cache.lock().await.get(host, now) {
			return Ok(hit);
		}

		let host_lock = {
			let mut inflight = self.inflight.lock().await;
			inflight.entry(host.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
		};
		let _guard = host_lock.lock().await;

		// Re-check: another task may have minted while we waited on `host_lock`.
		if let Some(hit) = self.cache.lock().await.get(host, OffsetDateTime::now_utc()) {
			self.inflight.lock().await.remove(host);
			return Ok(hit);
		}

		debug!(host, "minting leaf certificate");
		let leaf = self.mint(host)?;
		self.cache.lock().await.insert(host.to_string(), leaf.clone());
		self.inflight.lock().await.remove(host);
		Ok(leaf)
	}

	/// Builds a server-side TLS config presenting a freshly minted leaf for `host`, for the
	/// CONNECT-tunnel MITM handshake.
	pub async fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
		let leaf = self.leaf_for_host(host).await?;
		let certs = rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
			.collect::<Result<Vec<CertificateDer<'static>>, _>>()
			.map_err(|e| CaError::LeafMint { host: host.to_string(), reason: e.to_string() })?;
		let key = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
			.map_err(|e| CaError::LeafMint { host: host.to_string(), reason: e.to_string() })?
			.ok_or_else(|| CaError::LeafMint { host: host.to_string(), reason: "no private key in leaf PEM".into() })?;
		let config = ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(certs, key)
			.map_err(|e| CaError::LeafMint { host: host.to_string(), reason: e.to_string() })?;
		Ok(Arc::new(config))
	}

	fn mint(&self, host: &str) -> Result<CertifiedKey, CaError> {
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, host);
		let mut params = CertificateParams::new(vec![host.to_string()]).map_err(|e| CaError::LeafMint {
			host: host.to_string(),
			reason: e.to_string(),
		})?;
		params.distinguished_name = dn;
		params.subject_alt_names = vec![SanType::DnsName(host.try_into().map_err(|_| CaError::LeafMint {
			host: host.to_string(),
			reason: "host is not a valid DNS name".to_string(),
		})?)];
		let not_before = OffsetDateTime::now_utc() - TimeDuration::hours(1);
		let not_after = OffsetDateTime::now_utc() + self.leaf_ttl;
		params.not_before = not_before;
		params.not_after = not_after;

		let leaf_key = KeyPair::generate().map_err(|e| CaError::LeafMint { host: host.to_string(), reason: e.to_string() })?;
		let root_cert = self
			.root_params
			.clone()
			.self_signed(&self.root_key)
			.map_err(|e| CaError::LeafMint { host: host.to_string(), reason: e.to_string() })?;
		let cert = params
			.signed_by(&leaf_key, &root_cert, &self.root_key)
			.map_err(|e| CaError::LeafMint { host: host.to_string(), reason: e.to_string() })?;

		Ok(CertifiedKey {
			cert_pem: cert.pem(),
			key_pem: leaf_key.serialize_pem(),
			not_after,
		})
	}
}

fn root_params_from_existing() -> Result<CertificateParams, CaError> {
	let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| CaError::RootGeneration(e.to_string()))?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, "Intercepting Proxy Root CA");
	dn.push(DnType::OrganizationName, "Intercepting Proxy");
	params.distinguished_name = dn;
	params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
	params.key_usages = vec![rcgen::KeyUsagePurpose::KeyCertSign, rcgen::KeyUsagePurpose::CrlSign];
	params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
	params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(3650);
	Ok(params)
}

#[cfg(unix)]
fn write_private(path: &PathBuf, contents: &str) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::write(path, contents)?;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &PathBuf, contents: &str) -> std::io::Result<()> {
	std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tmp_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("proxy-ca-test-{name}-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		dir
	}

	#[tokio::test]
	async fn mints_leaf_with_correct_san_and_issuer() {
		let dir = tmp_dir("mint");
		let ca = CaStore::load_or_generate(&dir, 825).unwrap();
		let leaf = ca.leaf_for_host("example.test").await.unwrap();
		assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
		assert!(leaf.not_after > OffsetDateTime::now_utc());
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn mint_is_memoized_per_host() {
		let dir = tmp_dir("memo");
		let ca = CaStore::load_or_generate(&dir, 825).unwrap();
		let a = ca.leaf_for_host("example.test").await.unwrap();
		let b = ca.leaf_for_host("example.test").await.unwrap();
		assert_eq!(a.cert_pem, b.cert_pem);
		assert_eq!(ca.cached_leaf_count().await, 1);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn concurrent_mints_for_same_host_coalesce() {
		let dir = tmp_dir("coalesce");
		let ca = Arc::new(CaStore::load_or_generate(&dir, 825).unwrap());
		let mut handles = Vec::new();
		for _ in 0..8 {
			let ca = ca.clone();
			handles.push(tokio::spawn(async move { ca.leaf_for_host("coalesced.test").await.unwrap() }));
		}
		let mut pems = Vec::new();
		for h in handles {
			pems.push(h.await.unwrap().cert_pem);
		}
		assert!(pems.iter().all(|p| p == &pems[0]));
		assert_eq!(ca.cached_leaf_count().await, 1);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn reloads_persisted_root_across_instances() {
		let dir = tmp_dir("reload");
		let root_pem_1 = CaStore::load_or_generate(&dir, 825).unwrap().root_cert_pem().to_string();
		let root_pem_2 = CaStore::load_or_generate(&dir, 825).unwrap().root_cert_pem().to_string();
		assert_eq!(root_pem_1, root_pem_2);
		let _ = std::fs::remove_dir_all(&dir);
	}
}
