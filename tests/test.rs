use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use weft::{
    BoundExpr, DerivationTree, Environment, FuzzingMode, Generator, GeneratorArgs, GeneratorValue,
    Grammar, GrammarError, NonTerminal, ParseError, ParseOptions, Rule, Symbol, Terminal,
    TreeQuery, Value,
};

/// `<start> ::= <digit>+ ; <digit> ::= "0" | ... | "9"`
fn digits_grammar() -> Grammar {
    let mut b = Grammar::builder();
    let digits: Vec<_> = (0..10).map(|d| b.literal(&d.to_string())).collect();
    let digit = b.alternative(digits);
    b.rule("<digit>", digit);
    let digit_ref = b.nonterminal("<digit>");
    let body = b.plus(digit_ref);
    b.rule("<start>", body);
    let mut g = b.build().unwrap();
    g.prime().unwrap();
    g
}

/// `<start> ::= "a"{3}`
fn triple_a_grammar() -> Grammar {
    let mut b = Grammar::builder();
    let a = b.literal("a");
    let body = b.repeat(a, 3, 3);
    b.rule("<start>", body);
    let mut g = b.build().unwrap();
    g.prime().unwrap();
    g
}

/// `<start> ::= <n> <body> ; <n> ::= <byte> ; <body> ::= <byte>{int(n)}`
/// where `<byte>` matches any single byte.
fn length_prefixed_grammar() -> Grammar {
    let mut b = Grammar::builder();
    let any_byte = b.terminal(Terminal::regex_bytes("(?s:.)").unwrap());
    b.rule("<byte>", any_byte);
    let n_body = b.nonterminal("<byte>");
    b.rule("<n>", n_body);
    let byte_ref = b.nonterminal("<byte>");
    let min = BoundExpr::with_query("int(n)", "n", TreeQuery::new(["<n>"])).unwrap();
    let max = BoundExpr::with_query("int(n)", "n", TreeQuery::new(["<n>"])).unwrap();
    let body = b.repeat_bounds(byte_ref, min, max);
    b.rule("<body>", body);
    let n_ref = b.nonterminal("<n>");
    let body_ref = b.nonterminal("<body>");
    let start = b.concatenation(vec![n_ref, body_ref]);
    b.rule("<start>", start);
    let mut g = b.build().unwrap();
    g.prime().unwrap();
    g
}

/// `<start> ::= <bit>{16} ; <bit> ::= 0 | 1`
fn bit_grammar() -> Grammar {
    let mut b = Grammar::builder();
    let zero = b.bit(0);
    let one = b.bit(1);
    let bit = b.alternative(vec![zero, one]);
    b.rule("<bit>", bit);
    let bit_ref = b.nonterminal("<bit>");
    let body = b.repeat(bit_ref, 16, 16);
    b.rule("<start>", body);
    let mut g = b.build().unwrap();
    g.prime().unwrap();
    g
}

/// `<x> ::= "1" <digit> ; <y> ::= <digit>{2} := double(x)` where
/// `double(x) = int(x) * 2`, zero-padded to two digits.
fn generator_grammar() -> Grammar {
    let mut b = Grammar::builder();
    let digits: Vec<_> = (0..10).map(|d| b.literal(&d.to_string())).collect();
    let digit = b.alternative(digits);
    b.rule("<digit>", digit);
    let one = b.literal("1");
    let digit_ref = b.nonterminal("<digit>");
    let x_body = b.concatenation(vec![one, digit_ref]);
    b.rule("<x>", x_body);
    let digit_ref2 = b.nonterminal("<digit>");
    let y_body = b.repeat(digit_ref2, 2, 2);
    b.rule("<y>", y_body);
    b.generator(
        "<y>",
        Generator::new(
            "double(x)",
            vec![("x".to_string(), NonTerminal::new("<x>"))],
            |args: &GeneratorArgs<'_>| {
                let x = args.int("x").ok_or_else(|| "missing x".to_string())?;
                Ok(GeneratorValue::Str(format!("{:02}", x * 2)))
            },
        ),
    );
    let mut g = b.build().unwrap();
    g.prime().unwrap();
    g
}

#[test]
fn digit_fuzz_parses_back() {
    let mut g = digits_grammar();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let tree = g.fuzz(&mut rng, "<start>", 50).unwrap();
    let bytes = tree.to_bytes();
    assert!(!bytes.is_empty());
    assert!(bytes.iter().all(|b| b.is_ascii_digit()));
    let parsed = g.parse(bytes.clone(), "<start>").unwrap();
    assert_eq!(parsed.to_bytes(), bytes);
}

#[test]
fn fuzz_parse_round_trip_across_seeds() {
    let mut g = digits_grammar();
    for seed in 0..10 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let tree = g.fuzz(&mut rng, "<start>", 30).unwrap();
        let bytes = tree.to_bytes();
        let parsed = g.parse(bytes.clone(), "<start>").unwrap();
        assert_eq!(parsed.to_bytes(), bytes, "seed {}", seed);
    }
}

#[test]
fn deterministic_repetition() {
    let mut g = triple_a_grammar();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let tree = g.fuzz(&mut rng, "<start>", 100).unwrap();
    assert_eq!(tree.to_bytes(), b"aaa");
    assert!(g.parse(b"aa", "<start>").is_err());
    assert!(g.parse(b"aaa", "<start>").is_ok());
    assert!(g.parse(b"aaaa", "<start>").is_err());
}

#[test]
fn data_dependent_repetition_parses() {
    let mut g = length_prefixed_grammar();
    let tree = g.parse(&[0x03, 0x41, 0x42, 0x43][..], "<start>").unwrap();
    let root = tree.root();
    assert_eq!(tree.children(root).len(), 2);
    let body = tree.children(root)[1];
    assert_eq!(
        tree.symbol(body),
        &Symbol::NonTerminal(NonTerminal::new("<body>"))
    );
    assert_eq!(tree.children(body).len(), 3);
    assert_eq!(tree.to_bytes(), vec![0x03, 0x41, 0x42, 0x43]);
}

#[test]
fn data_dependent_repetition_rejects_wrong_count() {
    let mut g = length_prefixed_grammar();
    assert!(g.parse(&[0x02, 0x41, 0x42, 0x43][..], "<start>").is_err());
}

#[test]
fn data_dependent_repetition_fuzzes() {
    let mut g = length_prefixed_grammar();
    for seed in 0..5 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let tree = g.fuzz(&mut rng, "<start>", 50).unwrap();
        let bytes = tree.to_bytes();
        assert_eq!(bytes.len(), 1 + bytes[0] as usize, "seed {}", seed);
        let parsed = g.parse(bytes.clone(), "<start>").unwrap();
        assert_eq!(parsed.to_bytes(), bytes, "seed {}", seed);
    }
}

#[test]
fn bit_grammar_round_trip() {
    let mut g = bit_grammar();
    let tree = g.parse(b"\xAB\xCD", "<start>").unwrap();
    assert_eq!(tree.to_bytes(), vec![0xAB, 0xCD]);
    let bits = tree.to_bits();
    assert_eq!(bits.len(), 16);
    assert!(bits.starts_with("10101011"));
    assert_eq!(
        tree.value(tree.root()).unwrap(),
        Some(Value::Int(0xABCD))
    );
}

#[test]
fn bit_grammar_fuzz_parses_back() {
    let mut g = bit_grammar();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let tree = g.fuzz(&mut rng, "<start>", 100).unwrap();
    let bytes = tree.to_bytes();
    assert_eq!(bytes.len(), 2);
    let parsed = g.parse(bytes.clone(), "<start>").unwrap();
    assert_eq!(parsed.to_bytes(), bytes);
}

#[test]
fn generator_produces_and_records_sources() {
    let mut g = generator_grammar();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let tree = g.fuzz(&mut rng, "<y>", 50).unwrap();
    let root = tree.root();
    assert_eq!(
        tree.symbol(root),
        &Symbol::NonTerminal(NonTerminal::new("<y>"))
    );
    let sources = tree.sources(root);
    assert_eq!(sources.len(), 1);
    let x_surface = String::from_utf8(tree.subtree_bytes(sources[0])).unwrap();
    let x: i64 = x_surface.parse().unwrap();
    let expected = format!("{:02}", x * 2);
    assert_eq!(tree.to_bytes(), expected.as_bytes());
    for &child in tree.children(root) {
        assert!(tree.read_only(child));
    }
}

#[test]
fn replacing_a_source_regenerates_the_output() {
    let mut g = generator_grammar();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let tree = g.fuzz(&mut rng, "<y>", 50).unwrap();
    let x_id = tree.sources(tree.root())[0];
    let replacement = g.parse("12", "<x>").unwrap();
    let regenerated = tree.replace(&mut g, x_id, &replacement).unwrap();
    assert_eq!(regenerated.to_bytes(), b"24");
    let new_x = regenerated.sources(regenerated.root())[0];
    assert_eq!(regenerated.subtree_bytes(new_x), b"12");
}

#[test]
fn subtree_replace_keeps_the_rest() {
    let mut b = Grammar::builder();
    let x = b.literal("x");
    let y = b.literal("y");
    let a_body = b.alternative(vec![x, y]);
    b.rule("<a>", a_body);
    let w = b.literal("w");
    b.rule("<b>", w);
    let a_ref = b.nonterminal("<a>");
    let b_ref = b.nonterminal("<b>");
    let start = b.concatenation(vec![a_ref, b_ref]);
    b.rule("<start>", start);
    let mut g = b.build().unwrap();
    g.prime().unwrap();

    let tree = g.parse("xw", "<start>").unwrap();
    let a_id = tree.children(tree.root())[0];
    let b_id = tree.children(tree.root())[1];
    let replacement = g.parse("y", "<a>").unwrap();
    let replaced = tree.replace(&mut g, a_id, &replacement).unwrap();
    assert_eq!(replaced.to_bytes(), b"yw");
    let new_b = replaced.children(replaced.root())[1];
    assert_eq!(tree.hash(b_id), replaced.hash(new_b));
}

#[test]
fn read_only_subtrees_are_not_replaced() {
    let mut b = Grammar::builder();
    let x = b.literal("x");
    let y = b.literal("y");
    let a_body = b.alternative(vec![x, y]);
    b.rule("<a>", a_body);
    let a_ref = b.nonterminal("<a>");
    let start = b.concatenation(vec![a_ref]);
    b.rule("<start>", start);
    let mut g = b.build().unwrap();
    g.prime().unwrap();

    let mut tree = g.parse("x", "<start>").unwrap();
    let a_id = tree.children(tree.root())[0];
    tree.set_all_read_only(a_id, true);
    let replacement = g.parse("y", "<a>").unwrap();
    let replaced = tree.replace(&mut g, a_id, &replacement).unwrap();
    assert_eq!(replaced.to_bytes(), b"x");
}

#[test]
fn collapse_is_idempotent() {
    let mut g = digits_grammar();
    let raw = g
        .parse_with(
            "123",
            "<start>",
            ParseOptions {
                include_controlflow: true,
                ..Default::default()
            },
        )
        .unwrap();
    let once = g.collapse(&raw);
    let twice = g.collapse(&once);
    assert_eq!(once, twice);
    assert_eq!(once.to_bytes(), raw.to_bytes());
    assert_eq!(once.to_bytes(), b"123");
}

#[test]
fn sizes_count_self_plus_children() {
    let mut g = digits_grammar();
    let tree = g.parse("123", "<start>").unwrap();
    for id in tree.flatten(tree.root()) {
        let children_size: usize = tree.children(id).iter().map(|&c| tree.size(c)).sum();
        assert_eq!(tree.size(id), 1 + children_size);
    }
}

#[test]
fn mutation_invalidates_hashes_upwards() {
    let mut g = digits_grammar();
    let mut tree = g.parse("12", "<start>").unwrap();
    let root = tree.root();
    let child = tree.children(root)[0];
    let before_root = tree.hash(root);
    let before_child = tree.hash(child);
    tree.set_symbol(child, NonTerminal::new("<other>"));
    assert_ne!(tree.hash(child), before_child);
    assert_ne!(tree.hash(root), before_root);

    let before_root = tree.hash(root);
    tree.set_sender(child, Some("client"));
    assert_ne!(tree.hash(root), before_root);
}

#[test]
fn parsing_is_deterministic() {
    let mut g = digits_grammar();
    let first = g.parse("1234", "<start>").unwrap();
    let second = g.parse("1234", "<start>").unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.children(first.root()).len(),
        second.children(second.root()).len()
    );
}

#[test]
fn fuzzing_is_deterministic_under_a_seed() {
    let mut g = digits_grammar();
    let mut rng_a = ChaCha8Rng::seed_from_u64(42);
    let mut rng_b = ChaCha8Rng::seed_from_u64(42);
    let a = g.fuzz(&mut rng_a, "<start>", 50).unwrap();
    let b = g.fuzz(&mut rng_b, "<start>", 50).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.to_bytes(), b.to_bytes());
}

#[test]
fn coverage_stays_within_bounds() {
    let mut b = Grammar::builder();
    let a = b.literal("a");
    let bee = b.literal("b");
    let ab = b.alternative(vec![a, bee]);
    b.rule("<ab>", ab);
    let ab_ref = b.nonterminal("<ab>");
    let body = b.plus(ab_ref);
    b.rule("<start>", body);
    let mut g = b.build().unwrap();
    g.prime().unwrap();

    let mut trees = Vec::new();
    for seed in 0..5 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        trees.push(g.fuzz(&mut rng, "<start>", 30).unwrap());
    }
    for k in 1..=3 {
        let (ratio, covered, total) = g.compute_grammar_coverage(&trees, k).unwrap();
        assert!((0.0..=1.0).contains(&ratio), "k={} ratio={}", k, ratio);
        assert!(covered <= total);
    }
    let (ratio, _, _) = g.compute_grammar_coverage(&trees, 1).unwrap();
    assert!(ratio > 0.0);
}

#[test]
fn long_repetition_parses() {
    let mut g = digits_grammar();
    let input = "1".repeat(10_000);
    let tree = g.parse(input.as_str(), "<start>").unwrap();
    assert_eq!(tree.to_bytes(), input.as_bytes());
    assert_eq!(tree.children(tree.root()).len(), 10_000);
}

#[test]
fn incomplete_mode_accepts_prefixes() {
    let mut b = Grammar::builder();
    let abc = b.literal("abc");
    b.rule("<start>", abc);
    let mut g = b.build().unwrap();
    g.prime().unwrap();

    assert!(g.parse("ab", "<start>").is_err());
    let partial = g
        .parse_with("ab", "<start>", ParseOptions::incomplete())
        .unwrap();
    assert_eq!(partial.to_bytes(), b"ab");
}

#[test]
fn syntax_errors_report_the_failure_position() {
    let mut g = digits_grammar();
    let error = g.parse("12x3", "<start>").unwrap_err();
    assert_eq!(error.max_position(), Some(2));
    assert_eq!(g.max_position(), Some(2));
}

#[test]
fn unknown_start_symbol_suggests_a_name() {
    let mut g = digits_grammar();
    let error = g.parse("1", "<digits>").unwrap_err();
    let ParseError::UnknownStart { suggestion, .. } = error else {
        panic!("expected an unknown-start error");
    };
    assert_eq!(suggestion.0.as_deref(), Some("<digit>"));
}

#[test]
fn non_terminating_grammars_are_rejected() {
    let mut b = Grammar::builder();
    let a_ref = b.nonterminal("<a>");
    b.rule("<a>", a_ref);
    let mut g = b.build().unwrap();
    assert!(matches!(
        g.prime(),
        Err(GrammarError::NonTerminating(_))
    ));
}

#[test]
fn undefined_nonterminals_are_rejected_with_a_suggestion() {
    let mut b = Grammar::builder();
    let missing = b.nonterminal("<missing>");
    b.rule("<present>", missing);
    let mut g = b.build().unwrap();
    let error = g.prime().unwrap_err();
    let GrammarError::UnknownNonTerminal { symbol, suggestion } = error else {
        panic!("expected an unknown-nonterminal error");
    };
    assert_eq!(symbol.name(), "<missing>");
    assert_eq!(suggestion.0.as_deref(), Some("<present>"));
}

#[test]
fn environment_variables_drive_repetition_bounds() {
    let mut b = Grammar::builder();
    let a = b.literal("a");
    let min = BoundExpr::parse("n").unwrap();
    let max = BoundExpr::parse("n").unwrap();
    let body = b.repeat_bounds(a, min, max);
    b.rule("<start>", body);
    let mut env = Environment::new();
    env.set_local("n", Value::Int(2));
    b.environment(env);
    let mut g = b.build().unwrap();
    g.prime().unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let tree = g.fuzz(&mut rng, "<start>", 50).unwrap();
    assert_eq!(tree.to_bytes(), b"aa");
    assert!(g.parse("aa", "<start>").is_ok());
    assert!(g.parse("a", "<start>").is_err());
}

#[test]
fn drained_forests_are_cached() {
    let mut g = digits_grammar();
    let first: Vec<DerivationTree> = g
        .parse_forest("12", "<start>", ParseOptions::default())
        .collect();
    assert!(!first.is_empty());
    let second: Vec<DerivationTree> = g
        .parse_forest("12", "<start>", ParseOptions::default())
        .collect();
    assert_eq!(first, second);
}

#[test]
fn protocol_parties_are_collected() {
    let mut b = Grammar::builder();
    let ping = b.literal("ping");
    b.rule("<ping>", ping);
    let msg = b.message("<ping>", "client", Some("server"));
    b.rule("<start>", msg);
    let mut g = b.build().unwrap();
    g.prime().unwrap();

    let with_recipients = g.msg_parties(true);
    assert!(with_recipients.contains("client"));
    assert!(with_recipients.contains("server"));
    let senders_only = g.msg_parties(false);
    assert!(senders_only.contains("client"));
    assert!(!senders_only.contains("server"));
    assert!(g.check_message_nesting("<start>").is_ok());

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let tree = g.fuzz(&mut rng, "<start>", 20).unwrap();
    let msgs = tree.protocol_msgs();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].sender, "client");
    assert_eq!(msgs[0].recipient.as_deref(), Some("server"));
}

#[test]
fn nested_message_definitions_are_rejected() {
    let mut b = Grammar::builder();
    let pong = b.literal("pong");
    b.rule("<pong>", pong);
    let inner_msg = b.message("<pong>", "server", None);
    b.rule("<ping>", inner_msg);
    let outer_msg = b.message("<ping>", "client", None);
    b.rule("<start>", outer_msg);
    let mut g = b.build().unwrap();
    g.prime().unwrap();
    assert!(matches!(
        g.check_message_nesting("<start>"),
        Err(GrammarError::NestedMessages(_))
    ));
}

#[test]
fn grammar_content_queries() {
    let g = bit_grammar();
    assert!(g.contains_bits("<start>").unwrap());
    assert!(!g.contains_strings("<start>").unwrap());
    let g = digits_grammar();
    assert!(g.contains_strings("<start>").unwrap());
    assert!(!g.contains_bits("<start>").unwrap());
    assert!(!g.contains_bytes("<start>").unwrap());
}

#[test]
fn trees_render_for_debugging() {
    let mut g = digits_grammar();
    let tree = g.parse("12", "<start>").unwrap();
    let pretty = tree.to_tree();
    assert!(pretty.contains("<digit>"));
    let grammar_dump = tree.to_grammar();
    assert!(grammar_dump.contains("<start> ::="));
    assert!(grammar_dump.contains("<digit> ::="));
    assert!(g.rule_to_string("<start>").unwrap().contains("::="));
}

#[test]
fn update_merges_rules_and_reprimes() {
    let mut g = digits_grammar();
    let mut b = Grammar::builder();
    let x = b.literal("x");
    b.rule("<letter>", x);
    let other = b.build().unwrap();
    g.update(other).unwrap();
    assert!(g.contains("<letter>"));
    assert!(g.contains("<digit>"));
    assert!(g.parse("x", "<letter>").is_ok());
    assert!(g.parse("12", "<start>").is_ok());
}

#[test]
fn deepcopy_detaches_subtrees() {
    let mut g = digits_grammar();
    let tree = g.parse("12", "<start>").unwrap();
    let child = tree.children(tree.root())[0];
    let copy = tree.deepcopy(child);
    assert_eq!(copy.to_bytes(), tree.subtree_bytes(child));
    assert!(copy.parent(copy.root()).is_none());
    assert_eq!(tree.hash(child), copy.hash(copy.root()));
}

#[test]
fn direct_constructor_matches_the_builder() {
    let rules = vec![
        (
            NonTerminal::new("<start>"),
            Rule::Plus(Box::new(Rule::Ref(NonTerminal::new("<letter>")))),
        ),
        (
            NonTerminal::new("<letter>"),
            Rule::Alternative(vec![
                Rule::Terminal(Terminal::str("a")),
                Rule::Terminal(Terminal::str("b")),
            ]),
        ),
    ];
    let mut g = Grammar::new(rules, Vec::new(), FuzzingMode::Complete, Environment::new()).unwrap();
    g.prime().unwrap();
    assert!(g.parse("ab", "<start>").is_ok());
    assert!(g.parse("c", "<start>").is_err());
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let tree = g.fuzz(&mut rng, "<start>", 20).unwrap();
    assert!(g.parse(tree.to_bytes(), "<start>").is_ok());
}

#[test]
fn find_helpers_locate_nonterminals() {
    let mut g = digits_grammar();
    let tree = g.parse("123", "<start>").unwrap();
    let digit = NonTerminal::new("<digit>");
    assert_eq!(tree.find_all_nodes(tree.root(), &digit, true).len(), 3);
    assert_eq!(tree.find_all_trees(tree.root(), &digit).len(), 3);
    let symbols = tree.get_non_terminal_symbols(tree.root(), true);
    assert!(symbols.contains(&NonTerminal::new("<start>")));
    assert!(symbols.contains(&digit));
}
