/// Session load balancing
///
/// Picks the backend node a new session reads from, given configured
/// node weights, database/application redirect rules, and node roles.
/// Quarantined and Down nodes are never selected.
use rand::Rng;

use crate::registry::{BackendDescriptor, NodeRole};

/// Where a redirect rule points
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RedirectTarget {
    Node(usize),
    Primary,
    Standby,
}

/// One entry of a redirect preference list
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectRule {
    /// Database or application name the rule applies to
    pub name: String,
    pub target: RedirectTarget,
    /// Probability the suggestion is taken, in [0,1]
    pub weight: f64,
}

impl RedirectRule {
    /// Parse one `name:target` or `name:target(weight)` item, where
    /// target is `primary`, `standby`, or a node id
    pub fn parse(item: &str) -> Result<Self, String> {
        let (name, rest) = item
            .split_once(':')
            .ok_or_else(|| format!("redirect rule \"{}\" is missing ':'", item))?;
        if name.is_empty() {
            return Err(format!("redirect rule \"{}\" has an empty name", item));
        }

        let (target_str, weight) = match rest.split_once('(') {
            Some((t, w)) => {
                let w = w
                    .strip_suffix(')')
                    .ok_or_else(|| format!("redirect rule \"{}\" has an unclosed weight", item))?;
                let weight: f64 = w
                    .parse()
                    .map_err(|_| format!("redirect rule \"{}\" has a bad weight", item))?;
                if !(0.0..=1.0).contains(&weight) {
                    return Err(format!(
                        "redirect rule \"{}\" weight must be within [0,1]",
                        item
                    ));
                }
                (t, weight)
            }
            None => (rest, 1.0),
        };

        let target = match target_str {
            "primary" => RedirectTarget::Primary,
            "standby" => RedirectTarget::Standby,
            n => RedirectTarget::Node(
                n.parse()
                    .map_err(|_| format!("redirect rule \"{}\" has a bad target", item))?,
            ),
        };

        Ok(Self {
            name: name.to_string(),
            target,
            weight,
        })
    }

    /// Parse a comma-separated preference list
    pub fn parse_list(list: &str) -> Result<Vec<Self>, String> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// The session node selector
#[derive(Debug, Clone, Default)]
pub struct SessionBalancer {
    database_rules: Vec<RedirectRule>,
    app_name_rules: Vec<RedirectRule>,
}

impl SessionBalancer {
    pub fn new(database_rules: Vec<RedirectRule>, app_name_rules: Vec<RedirectRule>) -> Self {
        Self {
            database_rules,
            app_name_rules,
        }
    }

    /// Pick a node for a new session. Returns None only when no node
    /// is alive.
    pub fn select_node<R: Rng>(
        &self,
        nodes: &[BackendDescriptor],
        database: &str,
        application_name: Option<&str>,
        rng: &mut R,
    ) -> Option<usize> {
        let live: Vec<&BackendDescriptor> =
            nodes.iter().filter(|d| d.status.is_alive()).collect();
        if live.is_empty() {
            return None;
        }
        let master = live[0].id;
        let primary = live
            .iter()
            .find(|d| d.role == NodeRole::Primary)
            .map(|d| d.id);

        // An application-name rule wins over a database rule
        let rule = application_name
            .and_then(|app| self.app_name_rules.iter().find(|r| r.name == app))
            .or_else(|| self.database_rules.iter().find(|r| r.name == database));

        if let Some(rule) = rule {
            match rule.target {
                RedirectTarget::Standby => {
                    let standbys: Vec<&&BackendDescriptor> = live
                        .iter()
                        .filter(|d| Some(d.id) != primary)
                        .collect();
                    if standbys.is_empty() {
                        return Some(primary.unwrap_or(master));
                    }
                    if rng.gen::<f64>() < rule.weight {
                        let picked = weighted_pick(
                            standbys.iter().map(|d| (d.id, d.weight)),
                            rng,
                        );
                        return Some(picked.unwrap_or(master));
                    }
                    return Some(primary.unwrap_or(master));
                }
                RedirectTarget::Primary | RedirectTarget::Node(_) => {
                    let suggested = match rule.target {
                        RedirectTarget::Primary => primary,
                        RedirectTarget::Node(id) => {
                            live.iter().find(|d| d.id == id).map(|d| d.id)
                        }
                        RedirectTarget::Standby => unreachable!(),
                    };
                    if let Some(suggested) = suggested {
                        if rng.gen::<f64>() < rule.weight {
                            return Some(suggested);
                        }
                        let rest = weighted_pick(
                            live.iter()
                                .filter(|d| d.id != suggested)
                                .map(|d| (d.id, d.weight)),
                            rng,
                        );
                        return Some(rest.unwrap_or(suggested));
                    }
                    // Suggested node is not alive: fall through to the
                    // default weighted draw
                }
            }
        }

        weighted_pick(live.iter().map(|d| (d.id, d.weight)), rng).or(Some(master))
    }
}

/// Weighted random draw; None when the total weight is not positive
fn weighted_pick<R: Rng>(
    candidates: impl Iterator<Item = (usize, f64)>,
    rng: &mut R,
) -> Option<usize> {
    let candidates: Vec<(usize, f64)> = candidates.filter(|(_, w)| *w > 0.0).collect();
    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    let mut point = rng.gen::<f64>() * total;
    for (id, weight) in &candidates {
        point -= weight;
        if point < 0.0 {
            return Some(*id);
        }
    }
    candidates.last().map(|(id, _)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{test_descriptors, NodeStatus};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const DRAWS: usize = 10_000;

    fn distribution(
        balancer: &SessionBalancer,
        nodes: &[BackendDescriptor],
        database: &str,
        app: Option<&str>,
    ) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = vec![0usize; nodes.len()];
        for _ in 0..DRAWS {
            let id = balancer.select_node(nodes, database, app, &mut rng).unwrap();
            counts[id] += 1;
        }
        counts.iter().map(|c| *c as f64 / DRAWS as f64).collect()
    }

    #[test]
    fn test_rule_parsing() {
        let rule = RedirectRule::parse("prod:standby(0.8)").unwrap();
        assert_eq!(rule.name, "prod");
        assert_eq!(rule.target, RedirectTarget::Standby);
        assert!((rule.weight - 0.8).abs() < f64::EPSILON);

        let rule = RedirectRule::parse("analytics:2").unwrap();
        assert_eq!(rule.target, RedirectTarget::Node(2));
        assert!((rule.weight - 1.0).abs() < f64::EPSILON);

        assert!(RedirectRule::parse("nocolon").is_err());
        assert!(RedirectRule::parse("x:standby(1.5)").is_err());
        assert!(RedirectRule::parse("x:standby(0.5").is_err());

        let rules = RedirectRule::parse_list("prod:standby(0.8), analytics:primary").unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_weighted_distribution_1_1_2() {
        let mut nodes = test_descriptors(3);
        nodes[2].weight = 2.0;
        let balancer = SessionBalancer::default();

        let share = distribution(&balancer, &nodes, "shop", None);
        assert!((share[0] - 0.25).abs() < 0.02, "node0 share {}", share[0]);
        assert!((share[1] - 0.25).abs() < 0.02, "node1 share {}", share[1]);
        assert!((share[2] - 0.50).abs() < 0.02, "node2 share {}", share[2]);
    }

    #[test]
    fn test_standby_redirect_sends_80_percent_to_standbys() {
        let nodes = test_descriptors(3);
        let balancer = SessionBalancer::new(
            RedirectRule::parse_list("prod:standby(0.8)").unwrap(),
            Vec::new(),
        );

        let share = distribution(&balancer, &nodes, "prod", None);
        assert!((share[0] - 0.20).abs() < 0.02, "primary share {}", share[0]);
        // Standbys split the remaining 80% by equal weight
        assert!((share[1] - 0.40).abs() < 0.02, "node1 share {}", share[1]);
        assert!((share[2] - 0.40).abs() < 0.02, "node2 share {}", share[2]);
    }

    #[test]
    fn test_app_name_rule_wins_over_database_rule() {
        let nodes = test_descriptors(3);
        let balancer = SessionBalancer::new(
            RedirectRule::parse_list("prod:1").unwrap(),
            RedirectRule::parse_list("reporting:2").unwrap(),
        );

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let id = balancer
                .select_node(&nodes, "prod", Some("reporting"), &mut rng)
                .unwrap();
            assert_eq!(id, 2);
        }
    }

    #[test]
    fn test_down_and_quarantined_never_selected() {
        let mut nodes = test_descriptors(3);
        nodes[1].status = NodeStatus::Down;
        nodes[2].status = NodeStatus::Quarantined;
        let balancer = SessionBalancer::default();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert_eq!(balancer.select_node(&nodes, "db", None, &mut rng), Some(0));
        }
    }

    #[test]
    fn test_no_live_nodes_yields_none() {
        let mut nodes = test_descriptors(2);
        nodes[0].status = NodeStatus::Down;
        nodes[1].status = NodeStatus::Down;
        let balancer = SessionBalancer::default();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(balancer.select_node(&nodes, "db", None, &mut rng), None);
    }

    #[test]
    fn test_zero_weights_fall_back_to_master() {
        let mut nodes = test_descriptors(2);
        nodes[0].weight = 0.0;
        nodes[1].weight = 0.0;
        let balancer = SessionBalancer::default();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(balancer.select_node(&nodes, "db", None, &mut rng), Some(0));
    }

    #[test]
    fn test_concrete_node_rule_honors_weight() {
        let nodes = test_descriptors(3);
        let balancer = SessionBalancer::new(
            RedirectRule::parse_list("prod:2(0.5)").unwrap(),
            Vec::new(),
        );

        let share = distribution(&balancer, &nodes, "prod", None);
        // Half the draws take the suggestion; the other half spread
        // over the remaining two nodes by weight
        assert!((share[2] - 0.50).abs() < 0.02, "node2 share {}", share[2]);
        assert!((share[0] - 0.25).abs() < 0.02, "node0 share {}", share[0]);
        assert!((share[1] - 0.25).abs() < 0.02, "node1 share {}", share[1]);
    }

    #[test]
    fn test_rule_for_dead_node_falls_back_to_weighted_draw() {
        let mut nodes = test_descriptors(3);
        nodes[2].status = NodeStatus::Down;
        let balancer = SessionBalancer::new(
            RedirectRule::parse_list("prod:2").unwrap(),
            Vec::new(),
        );

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let id = balancer.select_node(&nodes, "prod", None, &mut rng).unwrap();
            assert!(id == 0 || id == 1);
        }
    }
}
