use config::{Config, ConfigError, Environment, File};
use gridlink_core::{GridError, PeerDescriptor};
use gridlink_driver::{BroadcastConfig, DiscoveryConfig, DriverSettings, IpExclusion};
use gridlink_transport::{ConnectorConfig, ListenerConfig, TlsIdentity, TlsTrust};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DriverdConfig {
    pub driver_name: String,
    pub listen_addr: String,
    pub listen_enabled: bool,
    pub listen_secure: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub hello_timeout: Duration,
    #[serde(deserialize_with = "deserialize_list")]
    pub peers: Vec<String>,
    /// `0s` reports static peers once.
    #[serde(with = "humantime_serde")]
    pub peer_retry_interval: Duration,
    pub broadcast_enabled: bool,
    pub broadcast_port: u16,
    #[serde(with = "humantime_serde")]
    pub broadcast_interval: Duration,
    pub broadcast_announce: bool,
    #[serde(deserialize_with = "deserialize_list")]
    pub broadcast_exclude: Vec<String>,
    pub tls_trust: String,
    #[serde(deserialize_with = "deserialize_list")]
    pub tls_pinned_certs: Vec<String>,
    pub default_admission_policy: String,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl DriverdConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("driver_name", "gridlink-driver")?
            .set_default("listen_addr", "0.0.0.0:11111")?
            .set_default("listen_enabled", true)?
            .set_default("listen_secure", false)?
            .set_default("tls_cert_path", None::<String>)?
            .set_default("tls_key_path", None::<String>)?
            .set_default("connect_timeout", "5s")?
            .set_default("hello_timeout", "5s")?
            .set_default("peers", Vec::<String>::new())?
            .set_default("peer_retry_interval", "0s")?
            .set_default("broadcast_enabled", false)?
            .set_default("broadcast_port", 11111)?
            .set_default("broadcast_interval", "5s")?
            .set_default("broadcast_announce", true)?
            .set_default("broadcast_exclude", Vec::<String>::new())?
            .set_default("tls_trust", "web-roots")?
            .set_default("tls_pinned_certs", Vec::<String>::new())?
            .set_default("default_admission_policy", "priority-share")?
            .set_default("report_interval", "30s")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the GRIDLINK_ source below sees it.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("GRIDLINK").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn tls_trust(&self) -> Result<TlsTrust, GridError> {
        match self.tls_trust.trim() {
            "web-roots" => Ok(TlsTrust::WebRoots),
            "insecure" => Ok(TlsTrust::Insecure),
            "pinned" => {
                if self.tls_pinned_certs.is_empty() {
                    return Err(GridError::configuration(
                        "tls_trust=pinned needs tls_pinned_certs",
                    ));
                }
                Ok(TlsTrust::pinned_from_files(&self.tls_pinned_certs)?)
            }
            other => Err(GridError::configuration(format!(
                "unknown tls_trust '{other}' (expected web-roots, insecure or pinned)"
            ))),
        }
    }

    fn listener_identity(&self) -> Result<Option<TlsIdentity>, GridError> {
        if !self.listen_secure {
            return Ok(None);
        }
        let identity = match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => TlsIdentity::load_der(cert, key)?,
            (None, None) => {
                tracing::warn!("no tls_cert_path/tls_key_path set; using a self-signed identity");
                TlsIdentity::generate_self_signed("localhost")?
            }
            _ => {
                return Err(GridError::configuration(
                    "tls_cert_path and tls_key_path must be set together",
                ))
            }
        };
        Ok(Some(identity))
    }

    pub fn to_settings(&self) -> Result<DriverSettings, GridError> {
        let static_peers = self
            .peers
            .iter()
            .map(|p| p.parse::<PeerDescriptor>())
            .collect::<Result<Vec<_>, _>>()?;
        let listener = if self.listen_enabled {
            Some(ListenerConfig {
                bind_addr: self.listen_addr.clone(),
                identity: self.listener_identity()?,
                hello_timeout: self.hello_timeout,
                ..ListenerConfig::default()
            })
        } else {
            None
        };
        let broadcast = if self.broadcast_enabled {
            let exclude = self
                .broadcast_exclude
                .iter()
                .map(|rule| rule.parse::<IpExclusion>())
                .collect::<Result<Vec<_>, _>>()?;
            Some(BroadcastConfig {
                bind_addr: SocketAddr::from(([0, 0, 0, 0], self.broadcast_port)),
                interval: self.broadcast_interval,
                exclude,
                ..BroadcastConfig::default()
            })
        } else {
            None
        };

        Ok(DriverSettings {
            driver_name: self.driver_name.clone(),
            connector: ConnectorConfig {
                local_name: self.driver_name.clone(),
                connect_timeout: self.connect_timeout,
                tls_trust: self.tls_trust()?,
            },
            discovery: DiscoveryConfig::default(),
            listener,
            static_peers,
            static_retry: Some(self.peer_retry_interval).filter(|d| !d.is_zero()),
            broadcast,
            broadcast_announce: self.broadcast_announce,
            default_admission_policy: self.default_admission_policy.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are process-wide.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        with_env(&[], || {
            let cfg = DriverdConfig::new(None).expect("failed to build config");

            assert_eq!(cfg.driver_name, "gridlink-driver");
            assert_eq!(cfg.listen_addr, "0.0.0.0:11111");
            assert!(cfg.listen_enabled);
            assert!(!cfg.listen_secure);
            assert!(cfg.tls_cert_path.is_none());
            assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
            assert_eq!(cfg.hello_timeout, Duration::from_secs(5));
            assert!(cfg.peers.is_empty());
            assert_eq!(cfg.peer_retry_interval, Duration::ZERO);
            assert!(!cfg.broadcast_enabled);
            assert_eq!(cfg.broadcast_port, 11111);
            assert_eq!(cfg.broadcast_interval, Duration::from_secs(5));
            assert_eq!(cfg.tls_trust, "web-roots");
            assert_eq!(cfg.default_admission_policy, "priority-share");
            assert_eq!(cfg.report_interval, Duration::from_secs(30));
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("GRIDLINK_DRIVER_NAME", "driver-env"),
                ("GRIDLINK_BROADCAST_PORT", "12000"),
                ("GRIDLINK_LISTEN_ENABLED", "false"),
                ("GRIDLINK_CONNECT_TIMEOUT", "250ms"),
                ("GRIDLINK_REPORT_INTERVAL", "1m30s"),
            ],
            || {
                let cfg = DriverdConfig::new(None).expect("failed to build config");
                assert_eq!(cfg.driver_name, "driver-env");
                assert_eq!(cfg.broadcast_port, 12000);
                assert!(!cfg.listen_enabled);
                assert_eq!(cfg.connect_timeout, Duration::from_millis(250));
                assert_eq!(cfg.report_interval, Duration::from_secs(90));
            },
        );
    }

    #[test]
    fn list_separator_parses_vec_fields() {
        with_env(
            &[
                (
                    "GRIDLINK_PEERS",
                    "b@10.0.0.2:11111; c@10.0.0.3:11443#secure",
                ),
                ("GRIDLINK_BROADCAST_EXCLUDE", "10.1.0.0/16,192.168.0.9"),
            ],
            || {
                let cfg = DriverdConfig::new(None).expect("failed to build config");
                assert_eq!(
                    cfg.peers,
                    vec![
                        "b@10.0.0.2:11111".to_string(),
                        "c@10.0.0.3:11443#secure".to_string()
                    ]
                );
                assert_eq!(cfg.broadcast_exclude.len(), 2);
            },
        );
    }

    #[test]
    fn file_overrides_take_precedence_over_defaults_and_env() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
driver_name = "driver-file"
broadcast_port = 4242
hello_timeout = "2s"
peers = ["b@10.0.0.2:11111"]
"#
        )
        .expect("write to temp file");

        with_env(&[("GRIDLINK_BROADCAST_PORT", "9999")], || {
            let cfg = DriverdConfig::new(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.driver_name, "driver-file");
            assert_eq!(cfg.broadcast_port, 9999);
            assert_eq!(cfg.hello_timeout, Duration::from_secs(2));
            assert_eq!(cfg.peers, vec!["b@10.0.0.2:11111".to_string()]);
        });
    }

    #[test]
    fn split_list_is_robust() {
        let cases = vec![
            ("a,b,c", vec!["a", "b", "c"]),
            ("a;b;c", vec!["a", "b", "c"]),
            ("a, b ; c ", vec!["a", "b", "c"]),
            (",a,,b;", vec!["a", "b"]),
            ("  ", Vec::<&str>::new()),
        ];
        for (input, expected) in cases {
            assert_eq!(split_list(input), expected, "failed on input: {}", input);
        }
    }

    fn base() -> DriverdConfig {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        DriverdConfig::new(None).expect("defaults")
    }

    #[test]
    fn settings_are_derived_from_config() {
        let mut cfg = base();
        cfg.peers = vec!["b@10.0.0.2:11111#secure".to_string()];
        cfg.peer_retry_interval = Duration::from_secs(10);
        cfg.broadcast_enabled = true;
        cfg.broadcast_exclude = vec!["10.0.0.0/8".to_string()];
        cfg.tls_trust = "insecure".to_string();

        let settings = cfg.to_settings().expect("settings");
        assert_eq!(settings.static_peers.len(), 1);
        assert!(settings.static_peers[0].secure());
        assert_eq!(settings.static_retry, Some(Duration::from_secs(10)));
        assert_eq!(settings.connector.tls_trust, TlsTrust::Insecure);
        assert_eq!(settings.connector.local_name, "gridlink-driver");
        let broadcast = settings.broadcast.expect("broadcast enabled");
        assert_eq!(broadcast.bind_addr.port(), 11111);
        assert_eq!(broadcast.exclude.len(), 1);
        let listener = settings.listener.expect("listener enabled");
        assert!(listener.identity.is_none());
    }

    #[test]
    fn secure_listener_without_paths_gets_self_signed_identity() {
        let mut cfg = base();
        cfg.listen_secure = true;
        let settings = cfg.to_settings().expect("settings");
        assert!(settings.listener.and_then(|l| l.identity).is_some());

        cfg.tls_cert_path = Some(PathBuf::from("cert.der"));
        assert!(matches!(cfg.to_settings(), Err(GridError::Configuration(_))));
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let mut cfg = base();
        cfg.peers = vec!["no-port".to_string()];
        assert!(matches!(cfg.to_settings(), Err(GridError::Configuration(_))));

        let mut cfg = base();
        cfg.tls_trust = "trust-me".to_string();
        assert!(matches!(cfg.to_settings(), Err(GridError::Configuration(_))));

        let mut cfg = base();
        cfg.tls_trust = "pinned".to_string();
        assert!(matches!(cfg.tls_trust(), Err(GridError::Configuration(_))));
        cfg.tls_pinned_certs = vec!["/nonexistent/gridlink/peer.der".to_string()];
        assert!(matches!(cfg.tls_trust(), Err(GridError::Configuration(_))));

        let mut cfg = base();
        cfg.broadcast_enabled = true;
        cfg.broadcast_exclude = vec!["nope".to_string()];
        assert!(matches!(cfg.to_settings(), Err(GridError::Configuration(_))));
    }
}
