use crate::{
    helpers::{cid_to_str, parse_cid},
    ports, redirects,
};
use anyhow::{anyhow, Context};
use quicpipe_common::{Cid, MAX_PORTS};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::OpenOptions,
    io::{Read, Write},
    net::SocketAddrV4,
    path::Path,
};

/// The control plane state, as stored on disk:
///
/// ```toml
/// ports = [4433]
///
/// [redirects]
/// "0102030405060708090a0b0c" = "10.0.0.5:4433"
/// ```
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: BTreeSet<u16>,
    #[serde(default)]
    pub redirects: BTreeMap<String, SocketAddrV4>,
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self, anyhow::Error> {
        let mut cfg: Config = toml::from_str(contents).context("Invalid config")?;
        cfg.normalize_redirects()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rewrites the cid keys in lower case hex. Keys that differ only in
    /// case name the same cid and are rejected.
    fn normalize_redirects(&mut self) -> Result<(), anyhow::Error> {
        let mut redirects = BTreeMap::new();
        for (key, target) in &self.redirects {
            let cid = cid_to_str(&parse_cid(key)?);
            if redirects.insert(cid, *target).is_some() {
                return Err(anyhow!("Duplicate redirect for cid {}", key));
            }
        }
        self.redirects = redirects;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.ports.len() > MAX_PORTS as usize {
            return Err(anyhow!(
                "Too many ports: {}, at most {} can be inspected",
                self.ports.len(),
                MAX_PORTS
            ));
        }
        self.redirect_entries()?;
        Ok(())
    }

    pub fn redirect_entries(&self) -> Result<Vec<(Cid, SocketAddrV4)>, anyhow::Error> {
        self.redirects
            .iter()
            .map(|(cid, target)| Ok((parse_cid(cid)?, *target)))
            .collect()
    }

    pub fn add_redirect(&mut self, cid: &Cid, target: SocketAddrV4) {
        self.redirects.insert(cid_to_str(cid), target);
    }

    pub fn description(&self) -> String {
        format!(
            "{} ports and {} redirects",
            self.ports.len(),
            self.redirects.len()
        )
    }

    /// Reads the live tables.
    fn fetch() -> Result<Self, anyhow::Error> {
        let mut cfg = Config::default();

        log::info!("fetching state ...");

        cfg.ports.extend(ports::ports()?);
        for (cid, target) in redirects::entries()? {
            cfg.add_redirect(&cid, target);
        }

        Ok(cfg)
    }

    /// Writes the config into the live tables. Existing entries are kept.
    fn apply(&self) -> Result<(), anyhow::Error> {
        let ports = self.ports.iter().copied().collect::<Vec<_>>();
        ports::add(&ports)?;

        let mut by_target: BTreeMap<SocketAddrV4, Vec<Cid>> = BTreeMap::new();
        for (cid, target) in self.redirect_entries()? {
            by_target.entry(target).or_default().push(cid);
        }
        for (target, cids) in by_target {
            redirects::add(target, &cids)?;
        }

        Ok(())
    }
}

pub struct ConfigFile {
    path: String,
}

impl ConfigFile {
    pub fn new<S: AsRef<str>>(filename: &S) -> Self {
        Self {
            path: String::from(filename.as_ref()),
        }
    }

    pub fn read(&self) -> Result<Config, anyhow::Error> {
        if !Path::new(&self.path).try_exists()? {
            return Err(anyhow!("Config file does not exits, {}", self.path));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .context(format!("Can't read config file: {}", self.path))?;
        let mut contents = String::new();
        let size = file.read_to_string(&mut contents)?;

        log::info!("Read {} bytes from: {}", size, self.path);

        let cfg = Config::parse(&contents).context(format!("Config file: {}", self.path))?;

        log::info!("Found in config: {}", cfg.description());
        Ok(cfg)
    }

    pub fn load(&self) -> Result<(), anyhow::Error> {
        let cfg = self.read()?;
        cfg.apply()?;
        log::info!("Loaded config: {}", cfg.description());
        Ok(())
    }

    pub fn write(&self, cfg: &Config) -> Result<(), anyhow::Error> {
        if Path::new(&self.path).try_exists()? {
            log::info!("Config file will be overridden, {}", self.path);
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .context(format!("Can't write to config file: {}", self.path))?;

        let contents = toml::to_string(cfg)?;

        file.write_all(contents.as_bytes())?;

        log::info!(
            "Wrote {} bytes to config file: {}",
            contents.len(),
            self.path
        );

        Ok(())
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        let cfg = Config::fetch()?;
        log::info!("Saving config: {}", cfg.description());
        self.write(&cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const SAMPLE: &str = r#"
ports = [4433, 443]

[redirects]
"0102030405060708090a0b0c" = "10.0.0.5:4433"
"0a0a0a0a0a0a0a0a0a0a0a0a" = "10.0.0.6:4433"
"#;

    #[test]
    fn parse_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.ports.iter().copied().collect::<Vec<_>>(), vec![443, 4433]);

        let entries = cfg.redirect_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            (
                Cid::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4433)
            )
        );
        assert_eq!(cfg.description(), "2 ports and 2 redirects");
    }

    #[test]
    fn sections_are_optional() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
        let cfg = Config::parse("ports = [443]").unwrap();
        assert!(cfg.redirects.is_empty());
    }

    #[test]
    fn invalid_entries() {
        let bad_cid = "[redirects]\n\"0102\" = \"10.0.0.5:4433\"\n";
        assert!(Config::parse(bad_cid).is_err());

        let bad_target = "[redirects]\n\"0102030405060708090a0b0c\" = \"10.0.0.5\"\n";
        assert!(Config::parse(bad_target).is_err());

        let bad_port = "ports = [70000]";
        assert!(Config::parse(bad_port).is_err());

        let too_many = format!(
            "ports = [{}]",
            (1..=MAX_PORTS + 1)
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        assert!(Config::parse(&too_many).is_err());
    }

    #[test]
    fn cid_keys_are_case_insensitive() {
        let upper = "[redirects]\n\"0A0A0A0A0A0A0A0A0A0A0A0A\" = \"10.0.0.6:4433\"\n";
        let cfg = Config::parse(upper).unwrap();
        assert_eq!(
            cfg.redirects.keys().collect::<Vec<_>>(),
            vec!["0a0a0a0a0a0a0a0a0a0a0a0a"]
        );

        let both = format!("{}\"0a0a0a0a0a0a0a0a0a0a0a0a\" = \"10.0.0.7:4433\"\n", upper);
        let err = Config::parse(&both).unwrap_err();
        assert!(err.to_string().contains("Duplicate redirect"));
    }

    #[test]
    fn saved_text_parses_back() {
        let mut cfg = Config::default();
        cfg.ports.insert(4433);
        cfg.add_redirect(
            &Cid::new([0xfe; 12]),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 8443),
        );

        let text = toml::to_string(&cfg).unwrap();
        assert!(text.contains("fefefefefefefefefefefefe"));
        assert!(text.contains("\"192.168.1.1:8443\""));
        assert_eq!(Config::parse(&text).unwrap(), cfg);
    }

    #[test]
    fn file_round_trip() {
        let path = std::env::temp_dir().join(format!("quicpipe-cfg-{}.toml", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let file = ConfigFile::new(&path);

        assert!(file.read().is_err());

        let cfg = Config::parse(SAMPLE).unwrap();
        file.write(&cfg).unwrap();
        assert_eq!(file.read().unwrap(), cfg);

        std::fs::remove_file(&path).unwrap();
    }
}
