//! In-memory representations of persistent nodes.

use crate::codec::BkBuf;
use crate::layout::{DDnode, DFnode, DInode, DSuper, DXnode};
use crate::spacemap::Agmap;
use crate::vaddr::Kind;

/// One decoded node. Metadata kinds keep their on-disk structs and are
/// mutated in place; space-maps use the bitmap form; leaves are raw
/// block payloads.
pub enum Node {
    Super(Box<DSuper>),
    Agmap(Box<Agmap>),
    Inode(Box<DInode>),
    Dnode(Box<DDnode>),
    Fnode(Box<DFnode>),
    Leaf(BkBuf),
    Xnode(Box<DXnode>),
}

impl Node {
    pub fn kind(&self) -> Kind {
        match self {
            Node::Super(_) => Kind::Super,
            Node::Agmap(_) => Kind::Agmap,
            Node::Inode(_) => Kind::Inode,
            Node::Dnode(_) => Kind::Dnode,
            Node::Fnode(_) => Kind::Fnode,
            Node::Leaf(_) => Kind::Leaf,
            Node::Xnode(_) => Kind::Xnode,
        }
    }
}
