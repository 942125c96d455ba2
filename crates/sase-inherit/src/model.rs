//! Fabric Object Model
//!
//! Structured identities and the read-only view of one routed-network
//! boundary as returned by a deep fetch.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Container type of an endpoint group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Routed-network boundary (L3-out)
    #[serde(rename = "l3out")]
    L3Out,
    /// Application profile
    #[serde(rename = "app")]
    App,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L3Out => write!(f, "l3out"),
            Self::App => write!(f, "app"),
        }
    }
}

/// Typed reference to the scope an endpoint group lives in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerRef {
    pub name: String,
    #[serde(alias = "container_type")]
    pub kind: ContainerKind,
}

/// Endpoint group identity: (tenant, container, name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId {
    pub tenant: String,
    #[serde(alias = "epg_container")]
    pub container: ContainerRef,
    pub name: String,
}

impl GroupId {
    /// Identity of an outside group inside an L3-out
    pub fn outside(tenant: &str, l3out: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            container: ContainerRef {
                name: l3out.to_string(),
                kind: ContainerKind::L3Out,
            },
            name: name.to_string(),
        }
    }

    /// Identity of an inside group inside an application profile
    pub fn inside(tenant: &str, app: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            container: ContainerRef {
                name: app.to_string(),
                kind: ContainerKind::App,
            },
            name: name.to_string(),
        }
    }

    /// Reconciliation scope this group belongs to (outside groups only)
    pub fn scope(&self) -> Option<ScopeId> {
        match self.container.kind {
            ContainerKind::L3Out => Some(ScopeId::new(&self.tenant, &self.container.name)),
            ContainerKind::App => None,
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}/{}",
            self.tenant, self.container.kind, self.container.name, self.name
        )
    }
}

/// Routed-network boundary: the unit of reconciliation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId {
    pub tenant: String,
    pub l3out: String,
}

impl ScopeId {
    pub fn new(tenant: &str, l3out: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            l3out: l3out.to_string(),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.l3out)
    }
}

/// Relation class between a group and a contract (or contract interface)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Group provides a contract
    ProvidesContract,
    /// Group consumes a contract
    ConsumesContract,
    /// Group consumes an imported contract interface
    ConsumesInterface,
}

impl RelationKind {
    pub const ALL: [RelationKind; 3] = [
        Self::ProvidesContract,
        Self::ConsumesContract,
        Self::ConsumesInterface,
    ];
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProvidesContract => write!(f, "fvRsProv"),
            Self::ConsumesContract => write!(f, "fvRsCons"),
            Self::ConsumesInterface => write!(f, "fvRsConsIf"),
        }
    }
}

/// A single relation held by a group: (kind, target name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationKey {
    pub kind: RelationKind,
    pub target: String,
}

impl RelationKey {
    pub fn new(kind: RelationKind, target: &str) -> Self {
        Self {
            kind,
            target: target.to_string(),
        }
    }

    pub fn provides(contract: &str) -> Self {
        Self::new(RelationKind::ProvidesContract, contract)
    }

    pub fn consumes(contract: &str) -> Self {
        Self::new(RelationKind::ConsumesContract, contract)
    }

    pub fn consumes_interface(interface: &str) -> Self {
        Self::new(RelationKind::ConsumesInterface, interface)
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)
    }
}

/// Engine-owned marker recording which ancestors justify a mirrored relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceTag {
    pub relation: RelationKey,
    pub contributors: BTreeSet<GroupId>,
}

impl ProvenanceTag {
    pub fn new(relation: RelationKey, contributors: BTreeSet<GroupId>) -> Self {
        Self {
            relation,
            contributors,
        }
    }

    /// Label as rendered on the fabric object
    pub fn label(&self) -> String {
        format!("inherited:{}", self.relation)
    }

    /// Reference count
    pub fn count(&self) -> usize {
        self.contributors.len()
    }
}

/// External (routed) endpoint group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutsideGroup {
    pub id: GroupId,
    #[serde(default)]
    pub subnets: BTreeSet<IpNet>,
    #[serde(default)]
    pub relations: BTreeSet<RelationKey>,
    /// Engine-owned relations, at most one tag per relation
    #[serde(default, with = "tag_list")]
    pub tags: BTreeMap<RelationKey, ProvenanceTag>,
}

impl OutsideGroup {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            subnets: BTreeSet::new(),
            relations: BTreeSet::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_subnet(mut self, subnet: IpNet) -> Self {
        self.subnets.insert(subnet);
        self
    }

    pub fn with_relation(mut self, relation: RelationKey) -> Self {
        self.relations.insert(relation);
        self
    }

    pub fn with_tag(mut self, tag: ProvenanceTag) -> Self {
        self.set_tag(tag);
        self
    }

    /// Replace the tag for the tag's relation
    pub fn set_tag(&mut self, tag: ProvenanceTag) {
        self.tags.insert(tag.relation.clone(), tag);
    }

    /// Provenance tag for a relation, if the engine owns it
    pub fn tag(&self, relation: &RelationKey) -> Option<&ProvenanceTag> {
        self.tags.get(relation)
    }

    pub fn holds(&self, relation: &RelationKey) -> bool {
        self.relations.contains(relation)
    }

    /// Relations held by the group that are not engine-tagged
    pub fn directly_held(&self) -> impl Iterator<Item = &RelationKey> + '_ {
        self.relations.iter().filter(|r| self.tag(r).is_none())
    }

    pub fn holds_directly(&self, relation: &RelationKey) -> bool {
        self.holds(relation) && self.tag(relation).is_none()
    }
}

/// Tags travel as a list; duplicate entries for one relation merge their contributors
mod tag_list {
    use super::{ProvenanceTag, RelationKey};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(
        tags: &BTreeMap<RelationKey, ProvenanceTag>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(tags.values())
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<RelationKey, ProvenanceTag>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut tags: BTreeMap<RelationKey, ProvenanceTag> = BTreeMap::new();
        for tag in Vec::<ProvenanceTag>::deserialize(deserializer)? {
            match tags.get_mut(&tag.relation) {
                Some(existing) => existing.contributors.extend(tag.contributors),
                None => {
                    tags.insert(tag.relation.clone(), tag);
                }
            }
        }
        Ok(tags)
    }
}

/// Internal endpoint group; relation holder only, never part of containment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsideGroup {
    pub id: GroupId,
    #[serde(default)]
    pub relations: BTreeSet<RelationKey>,
}

/// Deep snapshot of one routed-network boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub scope: ScopeId,
    #[serde(default)]
    pub groups: Vec<OutsideGroup>,
    #[serde(default)]
    pub inside_groups: Vec<InsideGroup>,
    #[serde(default)]
    pub contracts: BTreeSet<String>,
    #[serde(default)]
    pub interfaces: BTreeSet<String>,
}

impl ScopeSnapshot {
    pub fn empty(scope: ScopeId) -> Self {
        Self {
            scope,
            groups: Vec::new(),
            inside_groups: Vec::new(),
            contracts: BTreeSet::new(),
            interfaces: BTreeSet::new(),
        }
    }

    pub fn group(&self, id: &GroupId) -> Option<&OutsideGroup> {
        self.groups.iter().find(|g| &g.id == id)
    }

    pub fn contains_group(&self, id: &GroupId) -> bool {
        self.group(id).is_some()
    }

    /// Whether a relation target is defined in the tenant
    pub fn defines_target(&self, relation: &RelationKey) -> bool {
        match relation.kind {
            RelationKind::ProvidesContract | RelationKind::ConsumesContract => {
                self.contracts.contains(&relation.target)
            }
            RelationKind::ConsumesInterface => self.interfaces.contains(&relation.target),
        }
    }
}
