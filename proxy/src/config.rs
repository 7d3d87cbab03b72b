//! Environment-variable configuration, following the same `parse`/`parse_default` shape used
//! throughout the project's gateway ancestry: every setting has one canonical env var name, a
//! typed default, and a single place that can fail with a descriptive `ConfigError`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

const DEFAULT_BODY_CAP_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_LEAF_CERT_TTL_DAYS: i64 = 825;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
	pub api_host: IpAddr,
	pub api_port: u16,
	pub proxy_host: IpAddr,
	pub proxy_port: u16,
	pub metrics_port: u16,
	pub database_url: Option<String>,
	pub cors_origins: Vec<String>,
	pub body_size_cap_bytes: u64,
	pub leaf_cert_ttl_days: i64,
	pub ca_dir: PathBuf,
	pub worker_threads: usize,
	pub max_concurrent_scan_checks: usize,
}

impl ProxyConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Ok(ProxyConfig {
			api_host: parse_default("API_HOST", IpAddr::from([127, 0, 0, 1]))?,
			api_port: parse_default("API_PORT", 8000)?,
			proxy_host: parse_default("PROXY_HOST", IpAddr::from([127, 0, 0, 1]))?,
			proxy_port: parse_default("PROXY_PORT", 8080)?,
			metrics_port: parse_default("METRICS_PORT", 9090)?,
			database_url: empty_to_none(parse::<String>("DATABASE_URL")?),
			cors_origins: parse_list("CORS_ORIGINS"),
			body_size_cap_bytes: parse_default("BODY_SIZE_CAP_BYTES", DEFAULT_BODY_CAP_BYTES)?,
			leaf_cert_ttl_days: parse_default("LEAF_CERT_TTL_DAYS", DEFAULT_LEAF_CERT_TTL_DAYS)?,
			ca_dir: parse_default("CA_DIR", PathBuf::from("./.proxy-ca"))?,
			worker_threads: parse_worker_threads()?,
			max_concurrent_scan_checks: parse_default("MAX_CONCURRENT_SCAN_CHECKS", 8)?,
		})
	}
}

fn parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	match std::env::var(name) {
		Ok(value) => value
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| ConfigError::InvalidEnv { name: name.to_string(), value, reason: e.to_string() }),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	parse(name).map(|v| v.unwrap_or(default))
}

fn empty_to_none(value: Option<String>) -> Option<String> {
	value.filter(|v| !v.is_empty())
}

fn parse_list(name: &str) -> Vec<String> {
	std::env::var(name).map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()).unwrap_or_default()
}

/// `WORKER_THREADS` accepts a fixed integer or a `N%` share of the available CPUs, rounded up
/// (minimum 1), matching the operational convention for sizing worker pools proportionally.
fn parse_worker_threads() -> Result<usize, ConfigError> {
	match parse::<String>("WORKER_THREADS")? {
		Some(value) => {
			if let Some(percent_str) = value.strip_suffix('%') {
				let percent: f64 = percent_str.parse().map_err(|_| ConfigError::InvalidEnv { name: "WORKER_THREADS".into(), value: value.clone(), reason: "not a valid percentage".into() })?;
				if percent <= 0.0 || percent > 100.0 {
					return Err(ConfigError::InvalidEnv { name: "WORKER_THREADS".into(), value, reason: "percentage must be in (0, 100]".into() });
				}
				let cpus = num_cpus::get();
				Ok(((cpus as f64 * percent / 100.0).ceil() as usize).max(1))
			} else {
				value.parse::<usize>().map_err(|e| ConfigError::InvalidEnv { name: "WORKER_THREADS".into(), value, reason: e.to_string() })
			}
		}
		None => Ok(num_cpus::get()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	// Env vars are process-global; serialize tests that touch them.
	static ENV_LOCK: Mutex<()> = Mutex::new(());

	#[test]
	fn missing_var_falls_back_to_default() {
		let _guard = ENV_LOCK.lock().unwrap();
		unsafe { std::env::remove_var("BODY_SIZE_CAP_BYTES") };
		assert_eq!(parse_default::<u64>("BODY_SIZE_CAP_BYTES", DEFAULT_BODY_CAP_BYTES).unwrap(), DEFAULT_BODY_CAP_BYTES);
	}

	#[test]
	fn invalid_var_is_reported_with_name_and_value() {
		let _guard = ENV_LOCK.lock().unwrap();
		unsafe { std::env::set_var("LEAF_CERT_TTL_DAYS", "not-a-number") };
		let err = parse_default::<i64>("LEAF_CERT_TTL_DAYS", DEFAULT_LEAF_CERT_TTL_DAYS).unwrap_err();
		match err {
			ConfigError::InvalidEnv { name, value, .. } => {
				assert_eq!(name, "LEAF_CERT_TTL_DAYS");
				assert_eq!(value, "not-a-number");
			}
			_ => panic!("expected InvalidEnv"),
		}
		unsafe { std::env::remove_var("LEAF_CERT_TTL_DAYS") };
	}

	#[test]
	fn worker_threads_percentage_rounds_up() {
		let _guard = ENV_LOCK.lock().unwrap();
		unsafe { std::env::set_var("WORKER_THREADS", "1%") };
		let threads = parse_worker_threads().unwrap();
		assert!(threads >= 1);
		unsafe { std::env::remove_var("WORKER_THREADS") };
	}

	#[test]
	fn cors_origins_splits_and_trims_list() {
		let _guard = ENV_LOCK.lock().unwrap();
		unsafe { std::env::set_var("CORS_ORIGINS", "http://a.test, http://b.test") };
		assert_eq!(parse_list("CORS_ORIGINS"), vec!["http://a.test".to_string(), "http://b.test".to_string()]);
		unsafe { std::env::remove_var("CORS_ORIGINS") };
	}
}
