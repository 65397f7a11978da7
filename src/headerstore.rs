use std::collections::HashMap;

/// A single header field. `raw`, when present, holds the exact on-wire
/// bytes of the field (key, colon, folded value and line terminators) so
/// that writing an unmodified field reproduces it byte-for-byte. This is
/// required for signature schemes that canonicalize over raw header bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderField {
    key: String,
    value: String,
    raw: Option<Vec<u8>>,
}

impl HeaderField {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: canonical_key(&key.into()),
            value: value.into(),
            raw: None,
        }
    }

    pub(crate) fn with_raw<K: Into<String>, V: Into<String>>(
        key: K,
        value: V,
        raw: Vec<u8>,
    ) -> Self {
        Self {
            key: canonical_key(&key.into()),
            value: value.into(),
            raw: Some(raw),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The on-wire representation this field was parsed from, if it has
    /// not been rewritten since
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }
}

/// Canonicalize a header key: the first byte and every byte following a
/// `-` are uppercased, everything else is lowercased, so `content-TYPE`
/// becomes `Content-Type`. A key containing a non-token byte is returned
/// unchanged.
pub fn canonical_key(key: &str) -> String {
    if !key.bytes().all(is_token_byte) {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for b in key.bytes() {
        let b = if upper {
            b.to_ascii_uppercase()
        } else {
            b.to_ascii_lowercase()
        };
        upper = b == b'-';
        out.push(b as char);
    }
    out
}

fn is_token_byte(b: u8) -> bool {
    match b {
        b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'['
        | b']' | b'?' | b'=' | b'{' | b'}' | b' ' | b'\t' => false,
        33..=126 => true,
        _ => false,
    }
}

/// An ordered collection of header fields.
///
/// The representation is idempotent: a header parsed from bytes and
/// written back unmodified reproduces those bytes exactly. Mutation is
/// restricted to inserting a field at the top, deleting fields, and
/// copying; an in-place value rewrite is modeled as delete + add.
///
/// Fields are stored in reverse of wire order (the top of the header is
/// the last element) so that insert-at-top is a push, with a secondary
/// index mapping canonical key to field positions for cheap lookup.
#[derive(Debug, Default)]
pub struct HeaderStore {
    fields: Vec<HeaderField>,
    index: HashMap<String, Vec<usize>>,
}

impl Clone for HeaderStore {
    fn clone(&self) -> Self {
        // Rebuild the index rather than cloning it; positions are
        // relative so either works, but this keeps the invariant
        // obviously true
        let fields = self.fields.clone();
        let index = build_index(&fields);
        Self { fields, index }
    }
}

impl PartialEq for HeaderStore {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

fn build_index(fields: &[HeaderField]) -> HashMap<String, Vec<usize>> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (pos, f) in fields.iter().enumerate() {
        index.entry(f.key.clone()).or_default().push(pos);
    }
    index
}

impl HeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from fields listed in wire order (first field of
    /// the header block first)
    pub(crate) fn from_wire_fields(mut fields: Vec<HeaderField>) -> Self {
        fields.reverse();
        let index = build_index(&fields);
        Self { fields, index }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Insert a field at the top of the header
    pub fn add<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let field = HeaderField::new(key, value);
        self.index
            .entry(field.key.clone())
            .or_default()
            .push(self.fields.len());
        self.fields.push(field);
    }

    /// The value of the topmost field with this key, if any
    pub fn get(&self, key: &str) -> Option<&str> {
        let bucket = self.index.get(&canonical_key(key))?;
        let pos = *bucket.last()?;
        Some(self.fields[pos].value())
    }

    /// Replace all fields with this key by a single field at the top
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        self.del(&key);
        self.add(key, value);
    }

    /// Delete every field with this key
    pub fn del(&mut self, key: &str) {
        let key = canonical_key(key);
        while let Some(pos) = self.index.get(&key).and_then(|b| b.last().copied()) {
            self.remove_at(pos);
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.index.contains_key(&canonical_key(key))
    }

    /// Remove the field at `pos`, rebalancing the index so that every
    /// recorded position stays consistent with the field vector
    fn remove_at(&mut self, pos: usize) {
        let field = self.fields.remove(pos);
        let bucket = self
            .index
            .get_mut(&field.key)
            .expect("field key present in index");
        bucket.retain(|&p| p != pos);
        if bucket.is_empty() {
            self.index.remove(&field.key);
        }
        for bucket in self.index.values_mut() {
            for p in bucket.iter_mut() {
                if *p > pos {
                    *p -= 1;
                }
            }
        }
    }

    /// Iterate fields in wire order (top of the header first), read-only
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HeaderField> {
        self.fields.iter().rev()
    }

    /// Cursor over all fields, top of the header first. The store may
    /// not be otherwise mutated while the cursor is live; deletion goes
    /// through [`Fields::del`].
    pub fn fields(&mut self) -> Fields<'_> {
        Fields { store: self, cur: -1 }
    }

    /// Cursor over the fields with the given key, topmost first
    pub fn fields_by_key(&mut self, key: &str) -> FieldsByKey<'_> {
        FieldsByKey {
            key: canonical_key(key),
            store: self,
            cur: -1,
        }
    }
}

/// Iterates over header fields. The cursor starts before the first
/// field; use `next` to advance.
pub struct Fields<'a> {
    store: &'a mut HeaderStore,
    cur: isize,
}

impl Fields<'_> {
    pub fn next(&mut self) -> bool {
        self.cur += 1;
        (self.cur as usize) < self.store.fields.len()
    }

    fn pos(&self) -> usize {
        let len = self.store.fields.len();
        assert!(self.cur >= 0, "cursor method called before next");
        assert!((self.cur as usize) < len, "cursor method called after next returned false");
        len - 1 - self.cur as usize
    }

    pub fn key(&self) -> &str {
        self.store.fields[self.pos()].key()
    }

    pub fn value(&self) -> &str {
        self.store.fields[self.pos()].value()
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.store.fields[self.pos()].raw()
    }

    /// Delete the current field and leave the cursor positioned so that
    /// `next` moves to the following field
    pub fn del(&mut self) {
        let pos = self.pos();
        self.store.remove_at(pos);
        self.cur -= 1;
    }
}

/// Iterates over the fields sharing one key, topmost first
pub struct FieldsByKey<'a> {
    store: &'a mut HeaderStore,
    key: String,
    cur: isize,
}

impl FieldsByKey<'_> {
    fn bucket_len(&self) -> usize {
        self.store.index.get(&self.key).map(|b| b.len()).unwrap_or(0)
    }

    pub fn next(&mut self) -> bool {
        self.cur += 1;
        (self.cur as usize) < self.bucket_len()
    }

    fn pos(&self) -> usize {
        let len = self.bucket_len();
        assert!(self.cur >= 0, "cursor method called before next");
        assert!((self.cur as usize) < len, "cursor method called after next returned false");
        self.store.index[&self.key][len - 1 - self.cur as usize]
    }

    pub fn key(&self) -> &str {
        self.store.fields[self.pos()].key()
    }

    pub fn value(&self) -> &str {
        self.store.fields[self.pos()].value()
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.store.fields[self.pos()].raw()
    }

    pub fn del(&mut self) {
        let pos = self.pos();
        self.store.remove_at(pos);
        self.cur -= 1;
    }
}
