// telegram-sip-bridge/src/config.rs
use anyhow::{anyhow, Context, Result};
use ini::Ini;
use std::path::Path;
use std::time::Duration;

/// Application settings, loaded from an INI file (`settings.ini` by default).
#[derive(Debug, Clone)]
pub struct Settings {
    pub sip: SipSettings,
    pub telegram: TelegramSettings,
    pub logging: LoggingSettings,
    pub other: OtherSettings,
}

#[derive(Debug, Clone)]
pub struct SipSettings {
    pub port: u16,
    pub port_range: u16,
    pub public_address: Option<String>,
    /// SIP URI dialed for Telegram-initiated calls. Without it the
    /// inbound-Telegram path is disabled.
    pub callback_uri: Option<String>,
    pub id_uri: String,
    pub raw_pcm: bool,
    pub thread_count: usize,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub api_id: i32,
    pub api_hash: String,
    pub database_folder: String,
    pub system_language_code: String,
    pub device_model: String,
    pub system_version: String,
    pub application_version: String,
    pub phone_number: Option<String>,

    pub udp_p2p: bool,
    pub udp_reflector: bool,
    pub enable_aec: bool,
    pub enable_ns: bool,
    pub enable_agc: bool,

    pub proxy: Option<ProxySettings>,
    pub voip_proxy: Option<ProxySettings>,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Numeric log levels: 0=trace, 1=debug, 2=info, 3=warn, 4=error, 5=error, 6+=off.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub console_min_level: u8,
    pub file_min_level: u8,
    pub core: u8,
    pub sip: u8,
    pub tgvoip: u8,
    pub tdlib: u8,
    pub sip_messages: bool,
}

#[derive(Debug, Clone)]
pub struct OtherSettings {
    pub extra_wait_time: Duration,
    pub peer_flood_time: Duration,
}

fn get_str(ini: &Ini, section: &str, key: &str) -> Option<String> {
    ini.section(Some(section))
        .and_then(|s| s.get(key))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn get_or<T: std::str::FromStr>(ini: &Ini, section: &str, key: &str, default: T) -> Result<T> {
    match get_str(ini, section, key) {
        Some(v) => v
            .parse::<T>()
            .map_err(|_| anyhow!("invalid value for {}.{}: {}", section, key, v)),
        None => Ok(default),
    }
}

fn get_bool(ini: &Ini, section: &str, key: &str, default: bool) -> Result<bool> {
    match get_str(ini, section, key).as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(v) => Err(anyhow!("invalid boolean for {}.{}: {}", section, key, v)),
    }
}

fn get_proxy(ini: &Ini, prefix: &str) -> Result<Option<ProxySettings>> {
    let enabled = get_bool(ini, "telegram", &format!("use_{}proxy", prefix), false)?;
    if !enabled {
        return Ok(None);
    }
    let address = get_str(ini, "telegram", &format!("{}proxy_address", prefix))
        .ok_or_else(|| anyhow!("telegram.{}proxy_address is required when enabled", prefix))?;
    Ok(Some(ProxySettings {
        address,
        port: get_or(ini, "telegram", &format!("{}proxy_port", prefix), 1080u16)?,
        username: get_str(ini, "telegram", &format!("{}proxy_username", prefix)),
        password: get_str(ini, "telegram", &format!("{}proxy_password", prefix)),
    }))
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?;
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &Ini) -> Result<Self> {
        let sip = SipSettings {
            port: get_or(ini, "sip", "port", 5060u16)?,
            port_range: get_or(ini, "sip", "port_range", 0u16)?,
            public_address: get_str(ini, "sip", "public_address"),
            callback_uri: get_str(ini, "sip", "callback_uri"),
            id_uri: get_str(ini, "sip", "id_uri").unwrap_or_else(|| "sip:localhost".to_string()),
            raw_pcm: get_bool(ini, "sip", "raw_pcm", true)?,
            thread_count: get_or(ini, "sip", "thread_count", 1usize)?,
        };

        let telegram = TelegramSettings {
            api_id: get_or(ini, "telegram", "api_id", 0i32)?,
            api_hash: get_str(ini, "telegram", "api_hash").unwrap_or_default(),
            database_folder: get_str(ini, "telegram", "database_folder")
                .unwrap_or_else(|| "/data".to_string()),
            system_language_code: get_str(ini, "telegram", "system_language_code")
                .unwrap_or_else(|| "en-US".to_string()),
            device_model: get_str(ini, "telegram", "device_model")
                .unwrap_or_else(|| "PC".to_string()),
            system_version: get_str(ini, "telegram", "system_version")
                .unwrap_or_else(|| "Linux".to_string()),
            application_version: get_str(ini, "telegram", "application_version")
                .unwrap_or_else(|| "1.0".to_string()),
            phone_number: get_str(ini, "telegram", "phone_number"),
            udp_p2p: get_bool(ini, "telegram", "udp_p2p", false)?,
            udp_reflector: get_bool(ini, "telegram", "udp_reflector", true)?,
            enable_aec: get_bool(ini, "telegram", "enable_aec", false)?,
            enable_ns: get_bool(ini, "telegram", "enable_ns", false)?,
            enable_agc: get_bool(ini, "telegram", "enable_agc", false)?,
            proxy: get_proxy(ini, "")?,
            voip_proxy: get_proxy(ini, "voip_")?,
        };

        if telegram.api_id == 0 || telegram.api_hash.is_empty() {
            return Err(anyhow!("telegram.api_id and telegram.api_hash must be set"));
        }

        let logging = LoggingSettings {
            console_min_level: get_or(ini, "logging", "console_min_level", 0u8)?,
            file_min_level: get_or(ini, "logging", "file_min_level", 0u8)?,
            core: get_or(ini, "logging", "core", 2u8)?,
            sip: get_or(ini, "logging", "pjsip", 2u8)?,
            tgvoip: get_or(ini, "logging", "tgvoip", 5u8)?,
            tdlib: get_or(ini, "logging", "tdlib", 3u8)?,
            sip_messages: get_bool(ini, "logging", "sip_messages", true)?,
        };

        let other = OtherSettings {
            extra_wait_time: Duration::from_secs(get_or(ini, "other", "extra_wait_time", 30u64)?),
            peer_flood_time: Duration::from_secs(get_or(
                ini,
                "other",
                "peer_flood_time",
                86400u64,
            )?),
        };

        Ok(Settings {
            sip,
            telegram,
            logging,
            other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Ini {
        let mut ini = Ini::new();
        ini.with_section(Some("telegram"))
            .set("api_id", "12345")
            .set("api_hash", "abcdef");
        ini
    }

    #[test]
    fn defaults_applied() {
        let s = Settings::from_ini(&minimal()).unwrap();
        assert_eq!(s.sip.port, 5060);
        assert_eq!(s.sip.port_range, 0);
        assert_eq!(s.sip.id_uri, "sip:localhost");
        assert!(s.sip.raw_pcm);
        assert_eq!(s.telegram.database_folder, "/data");
        assert_eq!(s.telegram.device_model, "PC");
        assert_eq!(s.other.extra_wait_time, Duration::from_secs(30));
        assert_eq!(s.other.peer_flood_time, Duration::from_secs(86400));
        assert_eq!(s.logging.tgvoip, 5);
        assert!(s.logging.sip_messages);
        assert!(s.telegram.proxy.is_none());
    }

    #[test]
    fn missing_api_credentials_rejected() {
        let mut ini = Ini::new();
        ini.with_section(Some("telegram")).set("api_id", "12345");
        assert!(Settings::from_ini(&ini).is_err());
        assert!(Settings::from_ini(&Ini::new()).is_err());
    }

    #[test]
    fn proxy_section_parsed() {
        let mut ini = minimal();
        ini.with_section(Some("telegram"))
            .set("use_proxy", "true")
            .set("proxy_address", "127.0.0.1")
            .set("proxy_port", "9050");
        let s = Settings::from_ini(&ini).unwrap();
        let proxy = s.telegram.proxy.unwrap();
        assert_eq!(proxy.address, "127.0.0.1");
        assert_eq!(proxy.port, 9050);
        assert!(s.telegram.voip_proxy.is_none());
    }

    #[test]
    fn overrides_win_over_defaults() {
        let mut ini = minimal();
        ini.with_section(Some("sip"))
            .set("port", "5080")
            .set("port_range", "10")
            .set("callback_uri", "sip:gateway@pbx.local");
        ini.with_section(Some("other")).set("extra_wait_time", "5");
        let s = Settings::from_ini(&ini).unwrap();
        assert_eq!(s.sip.port, 5080);
        assert_eq!(s.sip.port_range, 10);
        assert_eq!(s.sip.callback_uri.as_deref(), Some("sip:gateway@pbx.local"));
        assert_eq!(s.other.extra_wait_time, Duration::from_secs(5));
    }
}
