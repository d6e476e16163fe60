pub mod tests {
    use crate::NodeId;

    /// Decorated unicode string that renders as "THE PONY HE COMES".
    /// Machine names are arbitrary text, so tests use hostile inputs.
    pub const UNICODE_PONY: &str = concat!(
        "TH\u{0318}E\u{0344}\u{0309}\u{0356} \u{0360}P\u{032f}\u{034d}\u{032d}O\u{031a}\u{200b}N",
        "\u{0310}Y\u{0321} H\u{0368}\u{034a}\u{033d}\u{0305}\u{033e}\u{030e}\u{0321}\u{0338}\u{032a}",
        "\u{032f}E\u{033e}\u{035b}\u{036a}\u{0344}\u{0300}\u{0301}\u{0327}\u{0358}\u{032c}\u{0329} ",
        "\u{0367}\u{033e}\u{036c}\u{0327}\u{0336}\u{0328}\u{0331}\u{0339}\u{032d}\u{032f}C\u{036d}",
        "\u{030f}\u{0365}\u{036e}\u{035f}\u{0337}\u{0319}\u{0332}\u{031d}\u{0356}O\u{036e}\u{034f}",
        "\u{032e}\u{032a}\u{031d}\u{034d}M\u{034a}\u{0312}\u{031a}\u{036a}\u{0369}\u{036c}\u{031a}",
        "\u{035c}\u{0332}\u{0316}E\u{0311}\u{0369}\u{034c}\u{035d}\u{0334}\u{031f}\u{031f}\u{0359}",
        "\u{031e}S\u{036f}\u{033f}\u{0314}\u{0328}\u{0340}\u{0325}\u{0345}\u{032b}\u{034e}\u{032d}",
    );

    /// Combining characters with no base; renders as scribbles.
    pub const UNICODE_SCRIBBLES: &str = concat!(
        " \u{031b} \u{0340} \u{0341} \u{0358} \u{0321} \u{0322} \u{0327} \u{0328} \u{0334} \u{0335} ",
        "\u{0336} \u{034f} \u{035c} \u{035d} \u{035e} \u{035f} \u{0360} \u{0362} \u{0338} \u{0337} ",
        "\u{0361} \u{0489}",
    );

    pub fn local_node(local: u64) -> NodeId {
        NodeId::new("localhost", local)
    }
}
