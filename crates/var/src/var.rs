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

use crate::string::VarStr;
use crate::variant::{ObjRef, Variant};
use crate::VarType;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};

/// Decimal digits rendered for a double unless the value says otherwise.
pub const DEFAULT_DIGS: u8 = 2;

/// Digits-after-point is carried in five bits of the serialized type word.
pub const MAX_DIGS: u8 = 31;

/// A dynamically typed value.
///
/// Carries one of undefined / long / double / string / object reference /
/// pointer token. Non-string values cache their stringified form until the
/// next mutation, so `as_str` can hand out a borrow without repeated
/// formatting.
pub struct Var {
    value: Variant,
    tmp: Option<Box<str>>,
}

impl Var {
    pub fn new() -> Self {
        Var {
            value: Variant::Undefined,
            tmp: None,
        }
    }

    pub fn variant(&self) -> &Variant {
        &self.value
    }

    pub fn type_code(&self) -> VarType {
        match &self.value {
            Variant::Undefined => VarType::Undefined,
            Variant::Long(_) => VarType::Long,
            Variant::Double { .. } => VarType::Double,
            Variant::Str(_) => VarType::Str,
            Variant::Obj(_) => VarType::Obj,
            Variant::Ptr(_) => VarType::Ptr,
        }
    }

    /// Number of digits rendered after the decimal point. Meaningful for
    /// doubles; other types report the default.
    pub fn digs(&self) -> u8 {
        match &self.value {
            Variant::Double { digs, .. } => *digs,
            _ => DEFAULT_DIGS,
        }
    }

    pub fn set_digs(&mut self, digs: u8) {
        if let Variant::Double { digs: d, .. } = &mut self.value {
            *d = digs.min(MAX_DIGS);
            self.tmp = None;
        }
    }

    pub fn clear(&mut self) {
        self.value = Variant::Undefined;
        self.tmp = None;
    }

    pub fn set_long(&mut self, x: i64) {
        self.value = Variant::Long(x);
        self.tmp = None;
    }

    /// Set a double value. An existing double keeps its digit count, anything
    /// else starts from the default.
    pub fn set_double(&mut self, x: f64) {
        let digs = match &self.value {
            Variant::Double { digs, .. } => *digs,
            _ => DEFAULT_DIGS,
        };
        self.value = Variant::Double { value: x, digs };
        self.tmp = None;
    }

    pub fn set_str(&mut self, x: &str) {
        self.value = Variant::Str(VarStr::from_str(x));
        self.tmp = None;
    }

    /// Set a string value, taking at most `max_chars` bytes of `x`. The cut
    /// is clamped back to a character boundary.
    pub fn set_str_n(&mut self, x: &str, max_chars: usize) {
        let mut end = max_chars.min(x.len());
        while end > 0 && !x.is_char_boundary(end) {
            end -= 1;
        }
        self.set_str(&x[..end]);
    }

    /// Copy another value into this one.
    pub fn set_var(&mut self, x: &Var) {
        self.value = x.value.clone();
        self.tmp = None;
    }

    /// Move another value into this one, leaving the source empty.
    pub fn take_var(&mut self, x: &mut Var) {
        self.value = std::mem::replace(&mut x.value, Variant::Undefined);
        x.tmp = None;
        self.tmp = None;
    }

    pub fn set_obj(&mut self, x: ObjRef) {
        self.value = Variant::Obj(x);
        self.tmp = None;
    }

    pub fn set_ptr(&mut self, x: usize) {
        self.value = Variant::Ptr(x);
        self.tmp = None;
    }

    pub fn is_empty(&self) -> bool {
        match &self.value {
            Variant::Undefined => true,
            Variant::Str(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Value as integer. Doubles round half away from zero, strings parse a
    /// leading integer, everything else is zero.
    pub fn get_long(&self) -> i64 {
        match &self.value {
            Variant::Long(x) => *x,
            Variant::Double { value, .. } => {
                if *value >= 0.0 {
                    (*value + 0.5) as i64
                } else {
                    -((-*value + 0.5) as i64)
                }
            }
            Variant::Str(s) => str_to_long(s.as_str()),
            _ => 0,
        }
    }

    pub fn get_double(&self) -> f64 {
        match &self.value {
            Variant::Long(x) => *x as f64,
            Variant::Double { value, .. } => *value,
            Variant::Str(s) => str_to_double(s.as_str()).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn get_obj(&self) -> Option<ObjRef> {
        match &self.value {
            Variant::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn get_ptr(&self) -> Option<usize> {
        match &self.value {
            Variant::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    /// Value as string. For non-string values the stringified form is built
    /// once and cached until the value mutates. Never fails; undefined is the
    /// empty string.
    pub fn as_str(&mut self) -> &str {
        if !matches!(self.value, Variant::Str(_)) && self.tmp.is_none() {
            self.tmp = Some(self.to_text().into_owned().into_boxed_str());
        }
        match &self.value {
            // Strings borrow directly from storage, no cache involved.
            Variant::Str(s) => s.as_str(),
            _ => self.tmp.as_deref().unwrap_or(""),
        }
    }

    /// Stringified form without touching the cache.
    pub fn to_text(&self) -> Cow<'_, str> {
        match &self.value {
            Variant::Undefined => Cow::Borrowed(""),
            Variant::Long(x) => Cow::Owned(x.to_string()),
            Variant::Double { value, digs } => {
                Cow::Owned(format!("{:.*}", *digs as usize, value))
            }
            Variant::Str(s) => Cow::Borrowed(s.as_str()),
            Variant::Obj(_) => Cow::Borrowed("<obj>"),
            Variant::Ptr(_) => Cow::Borrowed("<ptr>"),
        }
    }

    /// Drop the cached stringification, if any.
    pub fn release_tmp_str(&mut self) {
        self.tmp = None;
    }

    /// Append a string to the value. The value becomes a string if it was not
    /// one already.
    pub fn append_str(&mut self, x: &str) {
        self.make_string();
        if let Variant::Str(s) = &mut self.value {
            s.push_str(x);
        }
        self.tmp = None;
    }

    /// Append another value, stringified, to this one.
    pub fn append_var(&mut self, x: &Var) {
        let text = x.to_text().into_owned();
        self.append_str(&text);
    }

    /// Turn the value into an empty heap-backed string with room for `n`
    /// bytes and hand out the buffer.
    pub fn allocate(&mut self, n: usize) -> &mut String {
        self.value = Variant::Str(VarStr::with_capacity(n.max(crate::string::INLINE_CAP + 1)));
        self.tmp = None;
        match &mut self.value {
            Variant::Str(s) => s.heap_mut(),
            _ => unreachable!(),
        }
    }

    fn make_string(&mut self) {
        if !matches!(self.value, Variant::Str(_)) {
            let text = self.to_text().into_owned();
            self.value = Variant::Str(VarStr::from_str(&text));
        }
    }

    /// If the value is a string holding a well formed integer or C-locale
    /// decimal number, optionally convert it in place. Returns whether the
    /// string was (or could be) typed.
    pub fn autotype(&mut self, modify_value: bool) -> bool {
        let Variant::Str(s) = &self.value else {
            return false;
        };
        let Some(parsed) = parse_number(s.as_str()) else {
            return false;
        };
        if modify_value {
            match parsed {
                Parsed::Long(l) => self.set_long(l),
                Parsed::Double(d) => self.set_double(d),
            }
        }
        true
    }

    /// Three-way comparison.
    ///
    /// Numbers compare numerically, and a string that parses as a number
    /// joins them. Otherwise strings compare by byte order against the other
    /// side's stringified form. Undefined sorts before anything defined,
    /// except that it equals an empty string. Objects and pointers compare by
    /// identity only.
    pub fn compare(&self, x: &Var) -> Ordering {
        use Variant::*;

        // Empty-vs-empty ties undefined and "" together.
        if self.is_empty() || x.is_empty() {
            return match (self.is_empty(), x.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => unreachable!(),
            };
        }

        match (&self.value, &x.value) {
            (Long(a), Long(b)) => a.cmp(b),
            (Obj(a), Obj(b)) => a.cmp(b),
            (Ptr(a), Ptr(b)) => a.cmp(b),
            (Obj(_), _) => Ordering::Greater,
            (_, Obj(_)) => Ordering::Less,
            (Ptr(_), _) => Ordering::Greater,
            (_, Ptr(_)) => Ordering::Less,
            _ => {
                match (self.numeric_value(), x.numeric_value()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                    _ => {
                        // At least one side is a non-numeric string.
                        let a = self.to_text();
                        let b = x.to_text();
                        a.as_bytes().cmp(b.as_bytes())
                    }
                }
            }
        }
    }

    fn numeric_value(&self) -> Option<f64> {
        match &self.value {
            Variant::Long(x) => Some(*x as f64),
            Variant::Double { value, .. } => Some(*value),
            Variant::Str(s) => parse_number(s.as_str()).map(|p| match p {
                Parsed::Long(l) => l as f64,
                Parsed::Double(d) => d,
            }),
            _ => None,
        }
    }
}

enum Parsed {
    Long(i64),
    Double(f64),
}

/// Scan a string for a whole number token: optional blanks, optional sign
/// (blanks after the sign are tolerated), digits with at most one decimal
/// point, optional trailing blanks. Two dots (dates and the like) reject.
fn parse_number(s: &str) -> Option<Parsed> {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut cleaned = String::new();
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        if b[i] == b'-' {
            cleaned.push('-');
        }
        i += 1;
        while i < b.len() && b[i].is_ascii_whitespace() {
            i += 1;
        }
    }
    let mut digit_found = false;
    let mut dot_found = false;
    while i < b.len() {
        let c = b[i];
        if c.is_ascii_digit() {
            digit_found = true;
            cleaned.push(c as char);
        } else if c == b'.' {
            if dot_found {
                return None;
            }
            dot_found = true;
            cleaned.push('.');
        } else {
            // Only blanks may follow the number.
            while i < b.len() {
                if !b[i].is_ascii_whitespace() {
                    return None;
                }
                i += 1;
            }
            break;
        }
        i += 1;
    }
    if !digit_found {
        return None;
    }
    if dot_found {
        cleaned.parse::<f64>().ok().map(Parsed::Double)
    } else {
        cleaned.parse::<i64>().ok().map(Parsed::Long)
    }
}

/// Leading-integer parse: skips blanks, takes an optional sign and as many
/// digits as are there, ignores the rest. No digits means zero.
fn str_to_long(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    let neg = match b.get(i) {
        Some(b'-') => {
            i += 1;
            true
        }
        Some(b'+') => {
            i += 1;
            false
        }
        _ => false,
    };
    let start = i;
    let mut acc: i64 = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        acc = acc
            .saturating_mul(10)
            .saturating_add((b[i] - b'0') as i64);
        i += 1;
    }
    if i == start {
        return 0;
    }
    if neg { -acc } else { acc }
}

fn str_to_double(s: &str) -> Option<f64> {
    match parse_number(s) {
        Some(Parsed::Long(l)) => Some(l as f64),
        Some(Parsed::Double(d)) => Some(d),
        None => None,
    }
}

impl Default for Var {
    fn default() -> Self {
        Var::new()
    }
}

impl Clone for Var {
    fn clone(&self) -> Self {
        // The cached stringification stays behind.
        Var {
            value: self.value.clone(),
            tmp: None,
        }
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Debug for Var {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl From<i64> for Var {
    fn from(x: i64) -> Self {
        crate::v_long(x)
    }
}

impl From<f64> for Var {
    fn from(x: f64) -> Self {
        crate::v_double(x)
    }
}

impl From<&str> for Var {
    fn from(x: &str) -> Self {
        crate::v_str(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{v_double, v_empty, v_long, v_str};
    use pretty_assertions::assert_eq;

    #[test]
    fn long_round_trip() {
        let mut v = v_long(42);
        assert_eq!(v.get_long(), 42);
        assert_eq!(v.get_double(), 42.0);
        assert_eq!(v.as_str(), "42");
    }

    #[test]
    fn double_rounds_half_away_from_zero() {
        assert_eq!(v_double(2.5).get_long(), 3);
        assert_eq!(v_double(-2.5).get_long(), -3);
        assert_eq!(v_double(2.4).get_long(), 2);
        assert_eq!(v_double(-2.4).get_long(), -2);
    }

    #[test]
    fn digs_controls_string_form() {
        let mut v = v_double(3.14159);
        assert_eq!(v.as_str(), "3.14");
        v.set_digs(4);
        assert_eq!(v.as_str(), "3.1416");
        v.set_digs(0);
        assert_eq!(v.as_str(), "3");
    }

    #[test]
    fn tmp_string_invalidated_on_mutation() {
        let mut v = v_long(7);
        assert_eq!(v.as_str(), "7");
        v.set_long(8);
        assert_eq!(v.as_str(), "8");
    }

    #[test]
    fn append_makes_string() {
        let mut v = v_long(12);
        v.append_str(" monkeys");
        assert_eq!(v.type_code(), VarType::Str);
        assert_eq!(v.as_str(), "12 monkeys");

        let mut v = v_str("x=");
        v.append_var(&v_double(1.5));
        assert_eq!(v.as_str(), "x=1.50");
    }

    #[test]
    fn autotype_integers_and_decimals() {
        let mut v = v_str("  42 ");
        assert!(v.autotype(false));
        assert_eq!(v.type_code(), VarType::Str);
        assert!(v.autotype(true));
        assert_eq!(v.type_code(), VarType::Long);
        assert_eq!(v.get_long(), 42);

        let mut v = v_str("- 2.5");
        assert!(v.autotype(true));
        assert_eq!(v.type_code(), VarType::Double);
        assert_eq!(v.get_double(), -2.5);
    }

    #[test]
    fn autotype_rejects_dates_and_words() {
        assert!(!v_str("1.2.2016").autotype(false));
        assert!(!v_str("fish").autotype(false));
        assert!(!v_str("12 fish").autotype(false));
        assert!(!v_str("").autotype(false));
        assert!(!v_str(" + ").autotype(false));
        assert!(!v_long(5).autotype(false));
    }

    #[test]
    fn compare_numeric_and_coerced() {
        assert_eq!(v_long(1).compare(&v_long(2)), Ordering::Less);
        assert_eq!(v_long(2).compare(&v_double(1.5)), Ordering::Greater);
        assert_eq!(v_str("10").compare(&v_long(9)), Ordering::Greater);
        assert_eq!(v_double(2.0).compare(&v_str("2")), Ordering::Equal);
    }

    #[test]
    fn compare_strings_bytewise() {
        assert_eq!(v_str("abc").compare(&v_str("abd")), Ordering::Less);
        // "10 fish" does not autotype, so the long stringifies and compares
        // as bytes: "9" > "10 fish".
        assert_eq!(v_long(9).compare(&v_str("10 fish")), Ordering::Greater);
    }

    #[test]
    fn compare_undefined_and_empty() {
        assert_eq!(v_empty().compare(&v_str("")), Ordering::Equal);
        assert_eq!(v_empty().compare(&v_long(0)), Ordering::Less);
        assert_eq!(v_str("a").compare(&v_empty()), Ordering::Greater);
    }

    #[test]
    fn compare_identity_kinds() {
        let a = crate::v_obj(ObjRef::new(1, 1));
        let b = crate::v_obj(ObjRef::new(1, 2));
        assert_eq!(a.compare(&a.clone()), Ordering::Equal);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(a.compare(&v_str("zzz")), Ordering::Greater);
    }

    #[test]
    fn take_var_moves_and_clears() {
        let mut a = v_str("payload");
        let mut b = v_empty();
        b.take_var(&mut a);
        assert!(a.is_empty());
        assert_eq!(b.as_str(), "payload");
    }

    #[test]
    fn set_str_n_clamps() {
        let mut v = v_empty();
        v.set_str_n("abcdef", 3);
        assert_eq!(v.as_str(), "abc");
        v.set_str_n("ab", 10);
        assert_eq!(v.as_str(), "ab");
    }
}
