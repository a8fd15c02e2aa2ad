//! The hierarchical catalog of scopes and signals in a trace file.

use derive_more::{From, Into};
use typed_index_collections::TiVec;

use crate::value::NumericFormat;

#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Index of a transition sequence in the waveform store. Several netlist
/// signals can share one when the source aliases them.
#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignalRef(pub usize);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SignalEncoding {
    #[default]
    Bits,
    Real,
    String,
}

/// Opaque attribute attached to a scope (FST only).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u8,
    pub subtype: u8,
    pub name: String,
    pub arg: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ScopeInfo {
    /// `module`, `function`, `begin` etc. Only used to pick an icon.
    pub scope_type: String,
    /// Component (e.g. module definition) name if the format records one.
    pub component: String,
    pub children: Vec<NodeId>,
    pub attrs: Vec<Attribute>,
}

#[derive(Clone, Debug)]
pub struct SignalInfo {
    pub width: u32,
    /// Format-native identifier: the VCD id code or the FST handle.
    pub signal_id: String,
    pub signal: SignalRef,
    pub var_type: String,
    pub encoding: SignalEncoding,
    pub numeric_format: NumericFormat,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Scope(ScopeInfo),
    Signal(SignalInfo),
}

#[derive(Clone, Debug)]
pub struct NetlistNode {
    pub name: String,
    /// Dot-joined names of the enclosing scopes plus this node's name.
    pub full_path: String,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl NetlistNode {
    pub fn is_scope(&self) -> bool {
        matches!(self.kind, NodeKind::Scope(_))
    }

    pub fn signal(&self) -> Option<&SignalInfo> {
        match &self.kind {
            NodeKind::Signal(s) => Some(s),
            NodeKind::Scope(_) => None,
        }
    }

    pub fn scope(&self) -> Option<&ScopeInfo> {
        match &self.kind {
            NodeKind::Scope(s) => Some(s),
            NodeKind::Signal(_) => None,
        }
    }
}

/// Flat storage of the tree; nodes are in declaration order, which is also
/// depth-first order.
#[derive(Clone, Debug, Default)]
pub struct Netlist {
    nodes: TiVec<NodeId, NetlistNode>,
    roots: Vec<NodeId>,
}

impl Netlist {
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn get(&self, id: NodeId) -> Option<&NetlistNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.nodes.get(id).map(|n| &n.kind) {
            Some(NodeKind::Scope(scope)) => &scope.children,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NetlistNode)> {
        self.nodes.iter_enumerated()
    }

    pub fn signals(&self) -> impl Iterator<Item = (NodeId, &NetlistNode, &SignalInfo)> {
        self.nodes
            .iter_enumerated()
            .filter_map(|(id, node)| node.signal().map(|s| (id, node, s)))
    }

    pub fn scope_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_scope()).count()
    }

    /// Number of signal declarations. Aliased signals are counted once per
    /// declaration.
    pub fn signal_count(&self) -> usize {
        self.nodes.len() - self.scope_count()
    }

    pub fn find(&self, full_path: &str) -> Option<NodeId> {
        self.nodes
            .iter_enumerated()
            .find(|(_, n)| n.full_path == full_path)
            .map(|(id, _)| id)
    }

    /// All declarations that share the transition sequence `signal`.
    pub fn nodes_for(&self, signal: SignalRef) -> Vec<NodeId> {
        self.signals()
            .filter(|(_, _, s)| s.signal == signal)
            .map(|(id, _, _)| id)
            .collect()
    }

    pub fn set_numeric_format(&mut self, id: NodeId, format: NumericFormat) -> bool {
        match self.nodes.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Signal(s)) => {
                s.numeric_format = format;
                true
            }
            _ => false,
        }
    }
}

/// Builds a [`Netlist`] from a stream of scope open/close and variable
/// declarations.
#[derive(Debug, Default)]
pub struct NetlistBuilder {
    netlist: Netlist,
    stack: Vec<NodeId>,
}

impl NetlistBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn current_scope(&self) -> Option<NodeId> {
        self.stack.last().copied()
    }

    fn push_node(&mut self, name: String, kind: NodeKind) -> NodeId {
        let parent = self.current_scope();
        let full_path = match parent {
            Some(p) => format!("{}.{}", self.netlist.nodes[p].full_path, name),
            None => name.clone(),
        };
        let id = self.netlist.nodes.push_and_get_key(NetlistNode {
            name,
            full_path,
            parent,
            kind,
        });
        match parent {
            Some(p) => {
                if let NodeKind::Scope(scope) = &mut self.netlist.nodes[p].kind {
                    scope.children.push(id);
                }
            }
            None => self.netlist.roots.push(id),
        }
        id
    }

    /// Open a scope inside the current one and make it current.
    pub fn push_scope(&mut self, name: String, scope_type: String, component: String) -> NodeId {
        let id = self.push_node(
            name,
            NodeKind::Scope(ScopeInfo {
                scope_type,
                component,
                ..Default::default()
            }),
        );
        self.stack.push(id);
        id
    }

    /// Close the current scope. Returns `None` if there was none open.
    pub fn pop_scope(&mut self) -> Option<NodeId> {
        self.stack.pop()
    }

    /// Declare a signal in the current scope.
    pub fn add_signal(&mut self, name: String, info: SignalInfo) -> NodeId {
        self.push_node(name, NodeKind::Signal(info))
    }

    pub fn add_attribute(&mut self, attr: Attribute) {
        if let Some(scope) = self.current_scope() {
            if let NodeKind::Scope(info) = &mut self.netlist.nodes[scope].kind {
                info.attrs.push(attr);
            }
        }
    }

    pub fn finish(self) -> Netlist {
        self.netlist
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn signal(id: &str, signal: usize, width: u32) -> SignalInfo {
        SignalInfo {
            width,
            signal_id: id.to_owned(),
            signal: SignalRef(signal),
            var_type: "wire".to_owned(),
            encoding: SignalEncoding::Bits,
            numeric_format: NumericFormat::default(),
        }
    }

    #[test]
    fn test_paths_and_children() {
        let mut b = NetlistBuilder::new();
        let top = b.push_scope("top".into(), "module".into(), String::new());
        let clk = b.add_signal("clk".into(), signal("!", 0, 1));
        let sub = b.push_scope("sub".into(), "module".into(), String::new());
        let data = b.add_signal("data".into(), signal("#", 1, 8));
        assert_eq!(b.depth(), 2);
        assert_eq!(b.current_scope(), Some(sub));
        assert_eq!(b.pop_scope(), Some(sub));
        let alias = b.add_signal("clk_alias".into(), signal("!", 0, 1));
        assert_eq!(b.pop_scope(), Some(top));
        assert_eq!(b.pop_scope(), None);

        let netlist = b.finish();
        assert_eq!(netlist.roots(), &[top]);
        assert_eq!(netlist.children(top), &[clk, sub, alias]);
        assert_eq!(netlist.get(data).unwrap().full_path, "top.sub.data");
        assert_eq!(netlist.find("top.clk_alias"), Some(alias));
        assert_eq!(netlist.scope_count(), 2);
        assert_eq!(netlist.signal_count(), 3);
        assert_eq!(netlist.nodes_for(SignalRef(0)), vec![clk, alias]);
    }

    #[test]
    fn test_numeric_format_only_on_signals() {
        let mut b = NetlistBuilder::new();
        let top = b.push_scope("top".into(), "module".into(), String::new());
        let bus = b.add_signal("bus".into(), signal("b", 0, 4));
        let mut netlist = b.finish();
        assert!(!netlist.set_numeric_format(top, NumericFormat::Binary));
        assert!(netlist.set_numeric_format(bus, NumericFormat::Decimal));
        assert_eq!(
            netlist.get(bus).unwrap().signal().unwrap().numeric_format,
            NumericFormat::Decimal
        );
    }
}
