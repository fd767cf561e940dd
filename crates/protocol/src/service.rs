//! Well-known names of the privileged helper service

/// Unix socket on which the privileged helper accepts requests
pub const HELPER_SOCKET_PATH: &str = "/run/fleet-netd/helper.sock";

/// Authorization right required for `configureInterface` and `cleanupInterface`
pub const CONFIGURE_RIGHT: &str = "io.fleet.netd.configure-interface";
