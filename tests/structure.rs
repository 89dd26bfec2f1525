use k2net::rand::rngs::StdRng;
use k2net::rand::{Rng, SeedableRng};
use k2net::*;
use std::collections::HashSet;

macro_rules! check_product {
    ($($name:ident: $sizes:expr,)*) => {
        $(
        #[test]
        fn $name() {
            check_product(&$sizes);
        }
        )*
    }
}

check_product! {
    product_of_nothing: [],
    product_of_one: [3],
    product_of_two: [2, 3],
    product_of_three: [2, 1, 4],
    product_with_empty_domain: [3, 0, 2],
    product_of_many: [2, 2, 2, 2, 2, 2],
}

fn check_product(sizes: &[usize]) {
    let domains: Vec<Vec<usize>> = sizes.iter().map(|&size| (0..size).collect()).collect();
    let slices: Vec<&[usize]> = domains.iter().map(|domain| &domain[..]).collect();

    let mut seen = HashSet::new();
    for tuple in cartesian_product(&slices) {
        assert_eq!(tuple.len(), sizes.len());
        let tuple: Vec<usize> = tuple.into_iter().copied().collect();
        for (&value, &size) in tuple.iter().zip(sizes) {
            assert!(value < size);
        }
        let unique = seen.insert(tuple);
        // cartesian_product must not produce duplicates
        assert!(unique);
    }
    assert_eq!(seen.len(), sizes.iter().product::<usize>());
}

/// Builds a dataset where attribute 1 copies attribute 0 most of the time, attribute 2 is noise,
/// attribute 3 is text that depends on attribute 2, and the class mostly follows attribute 1.
fn synthetic(rows: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = (0..rows)
        .map(|_| {
            let a = rng.gen_range(0..3);
            let b = if rng.gen_bool(0.9) { a } else { rng.gen_range(0..3) };
            let c = rng.gen_range(0..2);
            let d = if c == 0 { "low" } else { "high" };
            let class = if rng.gen_bool(0.85) { b % 2 } else { 1 - b % 2 };
            let d = if rng.gen_bool(0.05) {
                Value::Wildcard
            } else {
                Value::from(d)
            };
            Row::new(
                vec![
                    Value::Number(a as f64),
                    Value::Number(b as f64),
                    Value::Number(c as f64),
                    d,
                ],
                class,
            )
        })
        .collect();
    Dataset::new(
        vec![
            "a".into(),
            "b".into(),
            "c".into(),
            "d".into(),
            "class".into(),
        ],
        vec!["even".into(), "odd".into()],
        rows,
    )
    .unwrap()
}

fn config(max_parents: usize, orderings: Orderings) -> SearchConfig {
    SearchConfig {
        max_parents,
        orderings,
        smoothing: 1.0,
    }
}

#[test]
fn same_seed_same_network() {
    let data = synthetic(200, 1);
    let config = config(2, Orderings::Random { trials: 8 });
    let first = learn(&data, &config, &mut StdRng::seed_from_u64(42)).unwrap();
    let second = learn(&data, &config, &mut StdRng::seed_from_u64(42)).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.score.to_bits(), second.score.to_bits());
}

#[test]
fn fixed_ordering_is_repeatable() {
    let data = synthetic(150, 2);
    let config = config(3, Orderings::Fixed);
    let first = learn(&data, &config, &mut StdRng::seed_from_u64(0)).unwrap();
    let second = learn(&data, &config, &mut StdRng::seed_from_u64(99)).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.ordering, (0..data.variable_count()).collect::<Vec<_>>());
}

#[test]
fn parents_respect_ordering_and_limit() {
    let data = synthetic(300, 3);
    for max_parents in 0..4 {
        let config = config(max_parents, Orderings::Random { trials: 5 });
        let learned = learn(&data, &config, &mut StdRng::seed_from_u64(max_parents as u64))
            .unwrap();
        let position = |variable: usize| {
            learned
                .ordering
                .iter()
                .position(|&v| v == variable)
                .unwrap()
        };
        for (variable, parents) in learned.network.iter() {
            assert!(parents.len() <= max_parents);
            for parent in parents.iter() {
                assert!(position(parent) < position(variable));
            }
        }
    }
}

#[test]
fn every_accepted_parent_improves_the_score() {
    let data = synthetic(250, 4);
    let scorer = Scorer::new(&data);
    let ordering = [4, 0, 1, 2, 3];
    for (position, &variable) in ordering.iter().enumerate() {
        let mut search = ParentSearch::new(&scorer, variable, &ordering[..position], 3).unwrap();
        let mut previous = search.score();
        loop {
            let before = search.parents().len();
            let state = search.step().unwrap();
            if search.parents().len() > before {
                assert!(search.score() > previous);
                previous = search.score();
            } else {
                assert_eq!(state, SearchState::Converged);
                assert_eq!(search.score(), previous);
            }
            if state == SearchState::Converged {
                break;
            }
        }
        assert!(search.parents().len() <= 3);
    }
}

#[test]
fn strong_dependency_is_found() {
    let data = synthetic(400, 5);
    let scorer = Scorer::new(&data);
    let learned = learn_with_ordering(&scorer, &[0, 1, 2, 3, 4], 1).unwrap();
    assert_eq!(learned.network.parents(1).as_slice(), &[0]);
}

#[test]
fn network_score_is_a_pure_function() {
    let data = synthetic(120, 6);
    let scorer = Scorer::new(&data);
    let learned = learn_with_ordering(&scorer, &[2, 3, 0, 1, 4], 2).unwrap();
    let first = scorer.score_network(&learned.network).unwrap();
    let second = Scorer::new(&data).score_network(&learned.network).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
    assert_eq!(first.to_bits(), learned.score.to_bits());

    let summed: f64 = learned
        .network
        .iter()
        .map(|(variable, parents)| scorer.score(variable, parents.as_slice()).unwrap())
        .sum();
    assert!((summed - first).abs() < 1e-9);
}

#[test]
fn network_score_rejects_wrong_size() {
    let data = synthetic(10, 7);
    let scorer = Scorer::new(&data);
    assert_eq!(
        scorer.score_network(&Network::independent(3)),
        Err(Error::NetworkSize {
            expected: 5,
            found: 3
        })
    );
}

#[test]
fn positive_smoothing_never_gives_zero_probability() {
    let data = synthetic(200, 8);
    let config = config(2, Orderings::Random { trials: 4 });
    let learned = learn(&data, &config, &mut StdRng::seed_from_u64(8)).unwrap();
    let predictor = Predictor::new(&data, &learned.network, 0.5).unwrap();

    let queries = vec![
        vec![
            Value::Number(0.0),
            Value::Number(0.0),
            Value::Number(0.0),
            Value::from("low"),
        ],
        vec![
            Value::Number(7.0),
            Value::from("unseen"),
            Value::Wildcard,
            Value::from("nowhere"),
        ],
    ];
    for query in &queries {
        for score in predictor.class_scores(query).unwrap() {
            assert!(score.is_finite());
        }
        assert!(predictor.predict(query).unwrap().is_some());
    }
}

#[test]
fn classifies_held_out_rows_better_than_chance() {
    let data = synthetic(400, 9);
    let training = data.select(0..300).unwrap();
    let config = config(2, Orderings::Random { trials: 6 });
    let learned = learn(&training, &config, &mut StdRng::seed_from_u64(9)).unwrap();
    let predictor = Predictor::new(&training, &learned.network, 1.0).unwrap();

    let correct = data.rows()[300..]
        .iter()
        .filter(|row| predictor.predict(&row.values).unwrap() == Some(row.class))
        .count();
    assert!(correct > 65, "only {} of 100 correct", correct);
}

#[test]
fn configuration_errors() {
    let data = synthetic(10, 10);
    let mut rng = StdRng::seed_from_u64(0);
    assert_eq!(
        learn(&data, &config(1, Orderings::Random { trials: 0 }), &mut rng),
        Err(Error::NoTrials)
    );
    let nan = SearchConfig {
        smoothing: f64::NAN,
        ..SearchConfig::default()
    };
    assert!(matches!(nan.validate(), Err(Error::InvalidSmoothing(_))));
    assert_eq!(SearchConfig::default().validate(), Ok(()));
}

#[test]
fn dataset_validation() {
    let header = || vec!["x".to_string(), "class".to_string()];
    let classes = || vec!["only".to_string()];
    assert_eq!(
        Dataset::new(vec![], classes(), vec![]).err(),
        Some(Error::MissingClassColumn)
    );
    assert_eq!(
        Dataset::new(
            header(),
            classes(),
            vec![Row::new(vec![], 0)]
        )
        .err(),
        Some(Error::RowWidth {
            row: 0,
            expected: 1,
            found: 0
        })
    );
    assert_eq!(
        Dataset::new(
            header(),
            classes(),
            vec![Row::new(vec![Value::Wildcard], 1)]
        )
        .err(),
        Some(Error::UnknownClass {
            row: 0,
            class: 1,
            classes: 1
        })
    );
}

#[test]
fn selecting_rows_recomputes_domains() {
    let data = synthetic(100, 11);
    assert_eq!(data.domain(0).len(), 3);
    let zeros: Vec<usize> = (0..data.row_count())
        .filter(|&row| data.value(row, 0) == &Value::Number(0.0))
        .collect();
    let subset = data.select(zeros.iter().copied()).unwrap();
    assert_eq!(subset.row_count(), zeros.len());
    assert_eq!(subset.domain(0).values(), &[Value::Number(0.0)]);
    assert_eq!(
        data.select(vec![100]).err(),
        Some(Error::RowOutOfRange {
            row: 100,
            rows: 100
        })
    );
}
