use std::time::Duration;

pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING_DIRECTORY: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(300);
pub const VALIDATION_INTERVAL: Duration = Duration::from_secs(2);
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(300);
// Lambda caps a single invocation at 15 minutes.
pub const INVOCATION_TIMEOUT: Duration = Duration::from_secs(14 * 60);

pub const ISSUER_MARKER: &str = "Let's Encrypt";
pub const ACCOUNT_KEY_FILE: &str = "./acme_account.json";

/// Path pattern of the bootstrap rule that forwards a domain's plain HTTP
/// traffic to the issuing function. Only the site root: a wildcard would
/// shadow challenge rules allocated after it.
pub const BOOTSTRAP_PATH_PATTERN: &str = "/";

/// Rules are listed in pages of this size (the control plane maximum).
pub const RULES_PAGE_SIZE: i32 = 400;
