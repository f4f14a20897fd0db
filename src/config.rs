use figment::Figment;
use figment::providers::Env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Figment> = OnceLock::new();

pub fn get_config() -> &'static Figment {
    CONFIG.get_or_init(figment_from_env)
}

/// `OXIDIMSE_SCP_*` variables become fields of the `scp` table.
pub(crate) fn figment_from_env() -> Figment {
    Figment::new()
        .merge(Env::prefixed("OXIDIMSE_").split("_"))
        .merge(Env::prefixed("OXIDIMSE_"))
        .merge(
            Env::prefixed("OXIDIMSE_SCP_")
                .map(|key| format!("scp.{}", key.as_str().to_ascii_lowercase()).into()),
        )
}
