//! Topic names used on the mesh.
//!
//! SUB sockets filter by byte prefix, so every topic ends in a fixed suffix
//! after the variable segment. Without it, subscribing to node `a`'s inbox
//! would also match node `ab`.

pub const PREFIX: &str = "dendrite";

/// Peer envelopes addressed to `node`.
pub fn node_inbox(node: &str) -> String {
    format!("{PREFIX}.node.{node}.msg")
}

/// Help-query replies addressed to `node`.
pub fn node_replies(node: &str) -> String {
    format!("{PREFIX}.node.{node}.reply")
}

/// Help queries fanned out to every node advertising `capability`.
pub fn capability_query(capability: &str) -> String {
    format!("{PREFIX}.capability.{capability}.query")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_shapes() {
        assert_eq!(node_inbox("scraper-1"), "dendrite.node.scraper-1.msg");
        assert_eq!(node_replies("scraper-1"), "dendrite.node.scraper-1.reply");
        assert_eq!(capability_query("scraper"), "dendrite.capability.scraper.query");
    }

    #[test]
    fn inbox_of_one_node_is_not_a_prefix_of_another() {
        assert!(!node_inbox("ab").starts_with(&node_inbox("a")));
        assert!(!node_replies("ab").starts_with(&node_replies("a")));
    }
}
