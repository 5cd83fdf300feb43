//! Ingress policies applied when a security group is first created.
//!
//! Role policies are a name → ruleset table so new roles are data, not code.

use crate::core::types::{IngressRule, Protocol, RuleSource};

const ANYWHERE: &str = "0.0.0.0/0";
const ADMIN_HOST: &str = "10.252.154.80/32";

#[derive(Debug, Clone, Copy)]
enum Source {
    Cidr(&'static str),
    SameGroup,
}

#[derive(Debug, Clone, Copy)]
struct RuleSpec {
    protocol: Protocol,
    from_port: i32,
    to_port: i32,
    source: Source,
}

const fn rule(protocol: Protocol, from_port: i32, to_port: i32, source: Source) -> RuleSpec {
    RuleSpec {
        protocol,
        from_port,
        to_port,
        source,
    }
}

impl RuleSpec {
    fn to_rule(self) -> IngressRule {
        let source = match self.source {
            Source::Cidr(cidr) => RuleSource::Cidr(cidr.to_string()),
            Source::SameGroup => RuleSource::SameGroup,
        };
        IngressRule::new(self.protocol, self.from_port, self.to_port, source)
    }
}

/// Intra-fleet ping, open ping, SSH and HTTP.
const DEFAULT_RULES: &[RuleSpec] = &[
    rule(Protocol::Icmp, -1, -1, Source::SameGroup),
    rule(Protocol::Icmp, -1, -1, Source::Cidr(ANYWHERE)),
    rule(Protocol::Tcp, 22, 22, Source::Cidr(ANYWHERE)),
    rule(Protocol::Tcp, 80, 80, Source::Cidr(ANYWHERE)),
];

const ROLE_POLICIES: &[(&str, &[RuleSpec])] = &[
    (
        "gmond",
        &[
            rule(Protocol::Tcp, 8649, 8649, Source::Cidr(ADMIN_HOST)),
            rule(Protocol::Tcp, 8651, 8651, Source::Cidr(ADMIN_HOST)),
        ],
    ),
    (
        "postgres",
        &[
            rule(Protocol::Icmp, -1, -1, Source::SameGroup),
            rule(Protocol::Tcp, 5432, 5432, Source::Cidr(ANYWHERE)),
        ],
    ),
];

pub fn default_rules() -> Vec<IngressRule> {
    DEFAULT_RULES.iter().map(|spec| spec.to_rule()).collect()
}

/// Extra rules for well-known role names; empty for everything else.
pub fn role_rules(group_name: &str) -> Vec<IngressRule> {
    ROLE_POLICIES
        .iter()
        .find(|(name, _)| *name == group_name)
        .map(|(_, specs)| specs.iter().map(|spec| spec.to_rule()).collect())
        .unwrap_or_default()
}

/// Every rule to authorize on a freshly created group, in issue order.
pub fn creation_rules(group_name: &str, default_ports: bool) -> Vec<IngressRule> {
    let mut rules = if default_ports {
        default_rules()
    } else {
        Vec::new()
    };
    rules.extend(role_rules(group_name));
    rules
}
