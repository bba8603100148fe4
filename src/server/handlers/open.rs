//! `/api/open`: hand an allow-listed URL to the desktop's URL opener

use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::thread::JoinHandle;

use regex::Regex;
use tracing::{debug, info, warn};

/// Exact URLs the client may open.
const ALLOWED_URLS: &[&str] = &[
    "https://shiftcrypto.ch/contact",
    "https://shiftcrypto.ch/shop",
    "https://shiftcrypto.ch/backup",
    "https://www.cryptocompare.com",
    "https://bitcoincore.org/en/2016/01/26/segwit-benefits/",
    "https://en.bitcoin.it/wiki/Bech32_adoption",
];

/// Block explorer transaction pages.
const ALLOWED_PATTERNS: &[&str] = &[
    r"^https://blockstream\.info/(testnet/)?tx/",
    r"^http://explorer\.litecointools\.com/tx/",
    r"^https://insight\.litecore\.io/tx/",
    r"^https://etherscan\.io/tx/",
    r"^https://rinkeby\.etherscan\.io/tx/",
    r"^https://ropsten\.etherscan\.io/tx/",
];

/// Characters a platform shell would interpret. Never valid in an accepted target.
const SHELL_METACHARACTERS: &[char] = &['&', '|', '^', '<', '>', '"', '%'];

/// Opens a URL or file path outside the gateway.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> io::Result<()>;
}

/// Opener backed by the platform's default handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl UrlOpener for SystemOpener {
    fn open(&self, url: &str) -> io::Result<()> {
        spawn_reaped(&mut open_command(url))?;
        info!(target: "gateway", url, "opened url");
        Ok(())
    }
}

/// Build the platform command that opens `url`. The target is always a
/// single argv entry and no shell is involved.
#[cfg(target_os = "macos")]
fn open_command(url: &str) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(target_os = "windows")]
fn open_command(url: &str) -> Command {
    let mut cmd = Command::new("rundll32");
    cmd.args(["url.dll,FileProtocolHandler", url]);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn open_command(url: &str) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

/// Spawn `cmd` and wait for it on a helper thread so the child is reaped.
fn spawn_reaped(cmd: &mut Command) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    let mut child = cmd.spawn()?;
    std::thread::Builder::new()
        .name("url-opener-reaper".to_string())
        .spawn(move || {
            let status = child.wait();
            if let Ok(status) = &status {
                debug!(target: "gateway", %status, "url opener exited");
            }
            status
        })
}

/// Allow-list deciding which URLs `/api/open` accepts.
#[derive(Debug)]
pub struct OpenPolicy {
    patterns: Vec<Regex>,
    downloads_dir: Option<PathBuf>,
}

impl OpenPolicy {
    /// Build the policy; files inside `downloads_dir` are also allowed.
    pub fn new(downloads_dir: Option<&Path>) -> Result<Self, regex::Error> {
        let patterns = ALLOWED_PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        if downloads_dir.is_none() {
            warn!(target: "gateway", "no downloads directory; exported files cannot be opened");
        }
        Ok(Self {
            patterns,
            downloads_dir: downloads_dir.map(Path::to_path_buf),
        })
    }

    pub fn is_allowed(&self, url: &str) -> bool {
        if url
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || SHELL_METACHARACTERS.contains(&c))
        {
            return false;
        }
        ALLOWED_URLS.contains(&url)
            || self.patterns.iter().any(|re| re.is_match(url))
            || self
                .downloads_dir
                .as_deref()
                .is_some_and(|dir| is_inside(Path::new(url), dir))
    }
}

/// Component-wise containment; any `..` disqualifies the path.
fn is_inside(path: &Path, dir: &Path) -> bool {
    path != dir
        && !path.components().any(|c| matches!(c, Component::ParentDir))
        && path.starts_with(dir)
}
