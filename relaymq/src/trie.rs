use std::clone::Clone;
use std::cmp::Eq;
use std::fmt::{self, Debug};
use std::hash::Hash;

use crate::topic::{Level, Topic};
use crate::types::{HashMap, HashSet};

pub type TopicTree<V> = Node<V>;

/// One level of the subscription trie. `values` holds the subscribers
/// terminated at this node; `branches` are keyed by literal level or
/// wildcard.
pub struct Node<V> {
    values: HashSet<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { values: HashSet::default(), branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: Hash + Eq + Clone + Debug,
{
    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, value: V) -> bool {
        let mut path = topic_filter.levels().clone();
        path.reverse();
        self._insert(path, value)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, value: V) -> bool {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, value)
        } else {
            self.values.insert(value)
        }
    }

    /// Removes `value` at the filter's terminator node and prunes branches
    /// that become empty and childless.
    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, value: &V) -> bool {
        self._remove(topic_filter.levels().as_ref(), value)
    }

    #[inline]
    fn _remove(&mut self, path: &[Level], value: &V) -> bool {
        if path.is_empty() {
            self.values.remove(value)
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..], value);
                if x.values.is_empty() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                false
            }
        }
    }

    /// Removes `value` from every node it appears in, pruning as it goes.
    #[inline]
    pub fn remove_all(&mut self, value: &V) {
        self.values.remove(value);
        self.branches.retain(|_, n| {
            n.remove_all(value);
            !(n.values.is_empty() && n.branches.is_empty())
        });
    }

    /// All filters matching `topic`, with the subscribers at each terminator.
    ///
    /// Topic names whose first level starts with `$` are matched only by
    /// filters whose first level is that literal; root-level `+`/`#` never
    /// match them.
    #[inline]
    pub fn matches(&self, topic: &Topic) -> HashMap<Topic, Vec<V>> {
        let mut out = HashMap::default();
        self._matches(topic.levels(), Vec::new(), &mut out);
        out
    }

    #[inline]
    fn _matches(&self, path: &[Level], mut sub_path: Vec<Level>, out: &mut HashMap<Topic, Vec<V>>) {
        let mut add_to_out = |levels: Vec<Level>, v_set: &HashSet<V>| {
            if !v_set.is_empty() {
                out.entry(Topic::from(levels))
                    .or_default()
                    .extend(v_set.iter().cloned().collect::<Vec<V>>());
            }
        };

        if path.is_empty() {
            // A `#` child also matches the parent level itself
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                if !n.values.is_empty() {
                    let mut sub_path = sub_path.clone();
                    sub_path.push(Level::MultiWildcard);
                    add_to_out(sub_path, &n.values);
                }
            }
            add_to_out(sub_path, &self.values);
        } else {
            // Topic names starting with $ cannot be matched by filters
            // starting with a wildcard
            if !(sub_path.is_empty()
                && !std::matches!(path[0], Level::Blank)
                && path[0].is_metadata()
                && (self.branches.contains_key(&Level::MultiWildcard)
                    || self.branches.contains_key(&Level::SingleWildcard)))
            {
                // Multi-level matching
                if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                    if !n.values.is_empty() {
                        let mut sub_path = sub_path.clone();
                        sub_path.push(Level::MultiWildcard);
                        add_to_out(sub_path, &n.values);
                    }
                }

                // Single-level matching
                if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                    let mut sub_path = sub_path.clone();
                    sub_path.push(Level::SingleWildcard);
                    n._matches(&path[1..], sub_path, out);
                }
            }

            // Literal matching
            if let Some(n) = self.branches.get(&path[0]) {
                sub_path.push(path[0].clone());
                n._matches(&path[1..], sub_path, out);
            }
        }
    }

    /// Is at least one stored filter matched by `topic`.
    #[inline]
    pub fn is_match(&self, topic: &Topic) -> bool {
        !self.matches(topic).is_empty()
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.values.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.branches.is_empty()
    }

    #[inline]
    pub fn values(&self) -> &HashSet<V> {
        &self.values
    }

    #[inline]
    pub fn children(&self) -> &HashMap<Level, Node<V>> {
        &self.branches
    }

    #[inline]
    pub fn child(&self, l: &Level) -> Option<&Node<V>> {
        self.branches.get(l)
    }

    #[inline]
    pub fn list(&self, top: usize) -> Vec<String> {
        let mut out = Vec::new();
        let parent = Level::Blank;
        self._list(&mut out, &parent, top, 0);
        out
    }

    #[inline]
    fn _list(&self, out: &mut Vec<String>, _parent: &Level, top: usize, depth: usize) {
        if top == 0 {
            return;
        }
        for (l, n) in self.branches.iter() {
            out.push(format!("{} {:?}, values: {:?}", " ".repeat(depth * 3), l.to_string(), n.values));
            n._list(out, l, top - 1, depth + 1);
        }
    }
}

impl<V> Debug for Node<V>
where
    V: Hash + Eq + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{Topic, TopicTree};
    use crate::types::SessionKey;

    fn match_one(topics: &TopicTree<SessionKey>, topic: &str, vs: &[SessionKey]) -> bool {
        let mut matcheds = 0;
        let t = Topic::from_str(topic).unwrap();
        for (_topic_filter, matched) in topics.matches(&t).iter() {
            let matched_len =
                matched.iter().filter(|v| vs.contains(*v)).collect::<Vec<&SessionKey>>().len();

            if matched_len != matched.len() {
                return false;
            }

            matcheds += matched.len();
        }
        matcheds == vs.len()
    }

    #[test]
    fn topic_tree() {
        let mut topics: TopicTree<SessionKey> = TopicTree::default();
        topics.insert(&Topic::from_str("/iot/b/x").unwrap(), 1);
        topics.insert(&Topic::from_str("/iot/b/x").unwrap(), 2);
        topics.insert(&Topic::from_str("/iot/b/y").unwrap(), 3);
        topics.insert(&Topic::from_str("/iot/cc/dd").unwrap(), 4);
        topics.insert(&Topic::from_str("/ddl/22/#").unwrap(), 5);
        topics.insert(&Topic::from_str("/ddl/+/+").unwrap(), 6);
        topics.insert(&Topic::from_str("/xyz/yy/zz").unwrap(), 7);
        topics.insert(&Topic::from_str("/xyz").unwrap(), 8);

        assert!(match_one(&topics, "/iot/b/x", &[1, 2]));
        assert!(match_one(&topics, "/iot/b/y", &[3]));
        assert!(match_one(&topics, "/iot/cc/dd", &[4]));
        assert!(!match_one(&topics, "/iot/cc/dd", &[0]));
        assert!(match_one(&topics, "/ddl/a/b", &[6]));
        assert!(match_one(&topics, "/xyz/yy/zz", &[7]));
        assert!(match_one(&topics, "/ddl/22/1/2", &[5]));
        assert!(match_one(&topics, "/ddl/22/1", &[5, 6]));
        assert!(match_one(&topics, "/ddl/22/", &[5, 6]));
        assert!(match_one(&topics, "/ddl/22", &[5]));

        assert!(topics.remove(&Topic::from_str("/iot/b/x").unwrap(), &2));
        assert!(topics.remove(&Topic::from_str("/xyz/yy/zz").unwrap(), &7));
        assert!(!topics.remove(&Topic::from_str("/xyz").unwrap(), &123));

        assert!(!match_one(&topics, "/xyz/yy/zz", &[7]));
    }

    #[test]
    fn wildcards_do_not_match_metadata_root() {
        let mut topics: TopicTree<SessionKey> = TopicTree::default();
        topics.insert(&Topic::from_str("#").unwrap(), 1);
        topics.insert(&Topic::from_str("+/info").unwrap(), 2);
        topics.insert(&Topic::from_str("$SYS/#").unwrap(), 3);
        topics.insert(&Topic::from_str("$SYS/info").unwrap(), 4);

        assert!(match_one(&topics, "$SYS/info", &[3, 4]));
        assert!(match_one(&topics, "any/info", &[1, 2]));
    }

    #[test]
    fn insert_remove_roundtrip() {
        let mut topics: TopicTree<SessionKey> = TopicTree::default();
        assert!(topics.is_empty());

        let f = Topic::from_str("a/+/c").unwrap();
        topics.insert(&f, 7);
        assert!(match_one(&topics, "a/b/c", &[7]));

        assert!(topics.remove(&f, &7));
        assert!(topics.is_empty());
        assert_eq!(topics.nodes_size(), 0);
    }

    #[test]
    fn remove_all_prunes() {
        let mut topics: TopicTree<SessionKey> = TopicTree::default();
        topics.insert(&Topic::from_str("a/b").unwrap(), 1);
        topics.insert(&Topic::from_str("a/#").unwrap(), 1);
        topics.insert(&Topic::from_str("a/b").unwrap(), 2);

        topics.remove_all(&1);
        assert!(match_one(&topics, "a/b", &[2]));
        assert!(!match_one(&topics, "a/z", &[1]));
        // only the a/b branch remains
        assert_eq!(topics.values_size(), 1);
    }
}
