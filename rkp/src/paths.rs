//! Coordination store layout.

pub fn running(app: &str) -> String {
    format!("/running/{app}")
}

/// Endpoints are grouped by proid: `proid.app#1` with endpoint `http` lives
/// at `/endpoints/proid/app#1:http`. A name without a dot is all proid.
pub fn endpoint(app: &str, endpoint: &str) -> String {
    let (proid, rest) = app.split_once('.').unwrap_or((app, ""));
    format!("/endpoints/{proid}/{rest}:{endpoint}")
}

pub fn identity_group(group: &str, identity: &str) -> String {
    format!("/identity-groups/{group}/{identity}")
}

pub fn server(node: &str) -> String {
    format!("/servers/{node}")
}

pub fn server_presence(node: &str) -> String {
    format!("/server.presence/{node}")
}

pub fn placement(node: &str) -> String {
    format!("/placement/{node}")
}

pub fn scheduled(app: &str) -> String {
    format!("/scheduled/{app}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_path_splits_proid() {
        assert_eq!(
            endpoint("treadmld.web#0000000042", "http"),
            "/endpoints/treadmld/web#0000000042:http"
        );
        assert_eq!(
            endpoint("proid.app.with.dots#1", "8080"),
            "/endpoints/proid/app.with.dots#1:8080"
        );
        assert_eq!(endpoint("bare", "http"), "/endpoints/bare/:http");
    }

    #[test]
    fn test_node_paths() {
        assert_eq!(server("n1"), "/servers/n1");
        assert_eq!(server_presence("n1"), "/server.presence/n1");
        assert_eq!(placement("n1"), "/placement/n1");
        assert_eq!(scheduled("p.a#1"), "/scheduled/p.a#1");
        assert_eq!(running("p.a#1"), "/running/p.a#1");
        assert_eq!(identity_group("g", "3"), "/identity-groups/g/3");
    }
}
