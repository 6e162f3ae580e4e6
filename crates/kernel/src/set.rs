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

use arbor_var::Var;

/// Ordered sparse map from a small signed id to a value. Backs the
/// per-object property override store and binding parameter sets.
#[derive(Clone, Default)]
pub struct ValueSet {
    items: Vec<(i32, Var)>,
}

impl ValueSet {
    pub fn new() -> Self {
        ValueSet { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: i32) -> Option<&Var> {
        self.items
            .binary_search_by_key(&id, |(k, _)| *k)
            .ok()
            .map(|i| &self.items[i].1)
    }

    /// Store a value under `id`; `None` removes any stored value.
    pub fn set(&mut self, id: i32, value: Option<&Var>) {
        match self.items.binary_search_by_key(&id, |(k, _)| *k) {
            Ok(i) => match value {
                Some(v) => self.items[i].1 = v.clone(),
                None => {
                    self.items.remove(i);
                }
            },
            Err(i) => {
                if let Some(v) = value {
                    self.items.insert(i, (id, v.clone()));
                }
            }
        }
    }

    pub fn set_long(&mut self, id: i32, value: i64) {
        self.set(id, Some(&arbor_var::v_long(value)));
    }

    pub fn set_str(&mut self, id: i32, value: &str) {
        self.set(id, Some(&arbor_var::v_str(value)));
    }

    pub fn get_long(&self, id: i32) -> i64 {
        self.get(id).map(|v| v.get_long()).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &Var)> {
        self.items.iter().map(|(k, v)| (*k, v))
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(other.items.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

impl std::fmt::Debug for ValueSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.items.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_var::{v_long, v_str};

    #[test]
    fn set_get_remove() {
        let mut s = ValueSet::new();
        s.set(3, Some(&v_long(30)));
        s.set(1, Some(&v_str("one")));
        s.set(2, Some(&v_long(20)));

        assert_eq!(s.get(1).unwrap().to_text(), "one");
        assert_eq!(s.get_long(3), 30);
        assert_eq!(s.len(), 3);

        // Ordered by id regardless of insertion order.
        let ids: Vec<i32> = s.iter().map(|(k, _)| k).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        s.set(2, None);
        assert!(s.get(2).is_none());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn overwrite_in_place() {
        let mut s = ValueSet::new();
        s.set_long(5, 1);
        s.set_long(5, 2);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get_long(5), 2);
    }
}
