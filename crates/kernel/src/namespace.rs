// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::handles::Oix;
use crate::rbtree::RbTree;
use arbor_var::Var;

/// Payload of a namespace node: an ordered multimap from name value to the
/// name node, ordered by variable comparison with ties in insertion order.
pub struct NsRec {
    pub index: RbTree<Var, Oix>,
    /// Explicit identifier, for namespaces addressed by id.
    pub id: Option<String>,
}

impl NsRec {
    pub fn new(id: Option<&str>) -> Self {
        NsRec {
            index: RbTree::new(),
            id: id.map(str::to_string),
        }
    }

    /// Earliest name entry matching `value`, or the first entry overall when
    /// `value` is None.
    pub fn find_first(&self, value: Option<&Var>) -> Option<usize> {
        match value {
            Some(v) => self.index.find_first(v),
            None => self.index.first(),
        }
    }
}
