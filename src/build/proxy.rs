// Proxy build arguments for image builds

use std::collections::BTreeMap;

/// Proxy variables set to the proxy URL (both cases, for tool compatibility)
pub(crate) const PROXY_VAR_NAMES: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Variables listing hosts that bypass the proxy
pub(crate) const NO_PROXY_VAR_NAMES: &[&str] = &["NO_PROXY", "no_proxy"];

/// Hosts that never go through the proxy during a build
pub(crate) const NO_PROXY_HOSTS: &str = "localhost,127.0.0.1";

/// Build the `--build-arg` map for a proxy URL, ordered by name
pub(crate) fn proxy_build_args(proxy_url: &str) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();

    for name in PROXY_VAR_NAMES {
        args.insert(name.to_string(), proxy_url.to_string());
    }
    for name in NO_PROXY_VAR_NAMES {
        args.insert(name.to_string(), NO_PROXY_HOSTS.to_string());
    }

    args
}
