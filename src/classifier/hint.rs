//! Routing hints embedded in statement comments
//!
//! ```sql
//! SELECT * FROM t -- maxscale route to master
//! SELECT * FROM t /* maxscale route to server db3 */
//! SELECT * FROM t -- maxscale max_slave_replication_lag=10
//! ```

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteHint {
    ToMaster,
    ToSlave,
    ToServer(String),
    /// Lag limit in seconds overriding the configured one
    MaxReplicationLag(u64),
}

/// Hints found in the comments of a statement, in order of appearance
pub fn parse_hints<'a>(comments: impl IntoIterator<Item = &'a str>) -> Vec<RouteHint> {
    comments.into_iter().filter_map(parse_hint).collect()
}

fn parse_hint(comment: &str) -> Option<RouteHint> {
    let mut words = comment.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("maxscale") {
        return None;
    }

    let rest: Vec<&str> = words.collect();
    match rest.as_slice() {
        [route, to, "master" | "MASTER"] if is_route_to(route, to) => Some(RouteHint::ToMaster),
        [route, to, "slave" | "SLAVE"] if is_route_to(route, to) => Some(RouteHint::ToSlave),
        [route, to, server, name] if is_route_to(route, to) && server.eq_ignore_ascii_case("server") => {
            Some(RouteHint::ToServer(name.to_string()))
        }
        _ => parse_lag(&rest.join("")),
    }
}

fn is_route_to(route: &str, to: &str) -> bool {
    route.eq_ignore_ascii_case("route") && to.eq_ignore_ascii_case("to")
}

fn parse_lag(assignment: &str) -> Option<RouteHint> {
    let (name, value) = assignment.split_once('=')?;
    if !name.eq_ignore_ascii_case("max_slave_replication_lag") {
        return None;
    }
    value.parse().ok().map(RouteHint::MaxReplicationLag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_hints() {
        let hints = parse_hints([
            " maxscale route to master",
            "MaxScale ROUTE TO slave ",
            "maxscale route to server db3",
            "just a comment",
        ]);
        assert_eq!(
            hints,
            vec![
                RouteHint::ToMaster,
                RouteHint::ToSlave,
                RouteHint::ToServer("db3".into())
            ]
        );
    }

    #[test]
    fn test_lag_hint() {
        assert_eq!(
            parse_hints(["maxscale max_slave_replication_lag = 10"]),
            vec![RouteHint::MaxReplicationLag(10)]
        );
        assert!(parse_hints(["maxscale max_slave_replication_lag=soon"]).is_empty());
        assert!(parse_hints(["maxscale route to nowhere"]).is_empty());
    }
}
