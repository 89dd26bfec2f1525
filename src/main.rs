use anyhow::{bail, ensure, Context};
use clap::Parser;
use csv_core::{ReadFieldResult, ReaderBuilder};
use k2net::rand::rngs::StdRng;
use k2net::rand::seq::SliceRandom;
use k2net::rand::SeedableRng;
use k2net::*;
use lasso::{Key, Rodeo, Spur};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str;
use tracing_subscriber::EnvFilter;

/// Learns a Bayesian network with the K2 algorithm and uses it to classify data.
///
/// The first line of each input file names the columns, and the last column holds the class.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Training data
    #[arg(short = 't', long)]
    train: PathBuf,

    /// Test data, classified using the network learned from the training data
    #[arg(short = 'T', long, conflicts_with = "folds")]
    test: Option<PathBuf>,

    /// Run NUM-fold cross validation on the training data
    #[arg(short = 'x', long, value_name = "NUM")]
    folds: Option<usize>,

    /// Most parents any variable may have
    #[arg(short = 'p', long, default_value_t = 2)]
    max_parents: usize,

    /// Number of random variable orderings to try
    #[arg(short = 'n', long, default_value_t = 10)]
    trials: usize,

    /// Search only the column order instead of random orderings
    #[arg(long)]
    fixed_order: bool,

    /// m-estimate used to smooth probabilities
    #[arg(short = 'm', long = "m-estimate", default_value_t = 1.0)]
    smoothing: f64,

    /// Seed for the random orderings and fold assignment
    #[arg(short = 's', long, default_value_t = 0)]
    seed: u64,

    /// Field delimiter
    #[arg(short = 'd', long, default_value_t = ',')]
    delimiter: char,

    /// Show the learned conditional probability tables and debug logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

/// The header and rows of one input file, before it's turned into a [`Dataset`].
struct RawTable {
    header: Vec<String>,
    rows: Vec<Row>,
}

fn load_data<I: io::Read>(
    mut input: I,
    delimiter: u8,
    classes: &mut Rodeo<Spur>,
) -> anyhow::Result<RawTable> {
    let mut inputbuf = [0; 16384];
    let mut fieldbuf = [0; 1024];
    let mut fieldlen = 0;
    let mut record: Vec<String> = Vec::new();
    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    let mut reader = ReaderBuilder::new().delimiter(delimiter).build();

    loop {
        let read = input.read(&mut inputbuf)?;
        let mut bytes = &inputbuf[..read];
        loop {
            let (result, nin, nout) = reader.read_field(bytes, &mut fieldbuf[fieldlen..]);
            let consumed = &bytes[..nin];
            bytes = &bytes[nin..];
            fieldlen += nout;
            match result {
                ReadFieldResult::InputEmpty => break,
                ReadFieldResult::OutputFull => {
                    bail!("field too long on line {}", reader.line());
                }
                ReadFieldResult::Field { record_end } => {
                    let field = str::from_utf8(&fieldbuf[..fieldlen])
                        .with_context(|| format!("invalid UTF-8 on line {}", reader.line()))?;
                    record.push(field.trim().to_owned());
                    fieldlen = 0;

                    if !record_end {
                        continue;
                    }
                    // A lone empty field is a blank line.
                    if record.len() == 1 && record[0].is_empty() {
                        record.clear();
                        continue;
                    }
                    // The reader counts the record's own newline once it consumes it.
                    let line = reader.line() - u64::from(consumed.last() == Some(&b'\n'));
                    match header {
                        None => header = Some(std::mem::take(&mut record)),
                        Some(ref names) => {
                            ensure!(
                                record.len() == names.len(),
                                "line {} has {} fields but the header has {}",
                                line,
                                record.len(),
                                names.len()
                            );
                            let label = record.pop().unwrap_or_default();
                            let class = classes.get_or_intern(label).into_usize();
                            let values = record.drain(..).map(|f| Value::parse(&f)).collect();
                            rows.push(Row::new(values, class));
                        }
                    }
                }
                ReadFieldResult::End => {
                    let header = header.context("no header line")?;
                    return Ok(RawTable { header, rows });
                }
            }
        }
    }
}

fn read_table(path: &Path, delimiter: u8, classes: &mut Rodeo<Spur>) -> anyhow::Result<RawTable> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    load_data(io::BufReader::new(file), delimiter, classes)
        .with_context(|| format!("reading {}", path.display()))
}

/// Tallies of actual against predicted classes.
struct Evaluation {
    /// `matrix[actual][predicted]`, with one extra column for rows that got no prediction.
    matrix: Vec<Vec<usize>>,
}

impl Evaluation {
    fn new(classes: usize) -> Self {
        Evaluation {
            matrix: vec![vec![0; classes + 1]; classes],
        }
    }

    fn record(&mut self, actual: usize, predicted: Option<usize>) {
        let column = predicted.unwrap_or(self.matrix.len());
        self.matrix[actual][column] += 1;
    }

    fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    fn correct(&self) -> usize {
        (0..self.matrix.len()).map(|class| self.matrix[class][class]).sum()
    }

    fn accuracy(&self) -> f64 {
        self.correct() as f64 / self.total().max(1) as f64
    }

    fn print(&self, class_names: &[String]) {
        let width = class_names
            .iter()
            .map(|name| name.len())
            .chain(Some(6))
            .max()
            .unwrap_or(6);
        print!("{:>w$}", "", w = width);
        for name in class_names {
            print!(" {:>w$}", name, w = width);
        }
        println!(" {:>w$}", "(none)", w = width);
        for (name, counts) in class_names.iter().zip(self.matrix.iter()) {
            print!("{:>w$}", name, w = width);
            for count in counts {
                print!(" {:>w$}", count, w = width);
            }
            println!();
        }
        println!(
            "Correct predictions: {} out of {} for an accuracy of {:.2}%",
            self.correct(),
            self.total(),
            self.accuracy() * 100.0
        );
    }
}

fn print_network(data: &Dataset, learned: &LearnedNetwork) {
    println!("network score: {:.5}", learned.score);
    for (variable, parents) in learned.network.iter() {
        let names: Vec<&str> = parents.iter().map(|p| data.variable_name(p)).collect();
        println!("  {} <- [{}]", data.variable_name(variable), names.join(", "));
    }
}

fn print_tables(data: &Dataset, predictor: &Predictor<'_>) -> anyhow::Result<()> {
    for table in predictor.tables()? {
        println!();
        println!("{}:", data.variable_name(table.variable));
        let values: Vec<String> = data
            .domain(table.variable)
            .values()
            .iter()
            .map(|v| v.to_string())
            .collect();
        println!("  given {:?} -> {}", table.parents.as_slice(), values.join(" "));
        for entry in table.entries {
            let given: Vec<String> = entry.instantiation.iter().map(|v| v.to_string()).collect();
            let probabilities: Vec<String> = entry
                .probabilities
                .iter()
                .map(|p| format!("{:.4}", p))
                .collect();
            println!(
                "  ({}) n={}: {}",
                given.join(", "),
                entry.rows,
                probabilities.join(" ")
            );
        }
    }
    Ok(())
}

fn evaluate(
    training: &Dataset,
    network: &Network,
    smoothing: f64,
    test: &[Row],
) -> anyhow::Result<Evaluation> {
    let predictor = Predictor::new(training, network, smoothing)?;
    let mut evaluation = Evaluation::new(training.class_names().len());
    for row in test {
        evaluation.record(row.class, predictor.predict(&row.values)?);
    }
    Ok(evaluation)
}

fn cross_validate(
    data: &Dataset,
    config: &SearchConfig,
    folds: usize,
    rng: &mut StdRng,
    verbose: bool,
) -> anyhow::Result<()> {
    use statrs::statistics::Statistics;

    ensure!(
        folds >= 2 && folds <= data.row_count(),
        "need between 2 and {} folds, not {}",
        data.row_count(),
        folds
    );

    let mut order: Vec<usize> = (0..data.row_count()).collect();
    order.shuffle(rng);

    let mut accuracies = Vec::with_capacity(folds);
    for fold in 0..folds {
        let (held_out, kept): (Vec<(usize, usize)>, Vec<(usize, usize)>) = order
            .iter()
            .copied()
            .enumerate()
            .partition(|(position, _)| position % folds == fold);
        let training = data.select(kept.into_iter().map(|(_, row)| row))?;
        let test: Vec<Row> = held_out
            .into_iter()
            .map(|(_, row)| data.rows()[row].clone())
            .collect();

        let learned = learn(&training, config, rng)?;
        println!();
        println!("fold {}:", fold + 1);
        if verbose {
            print_network(&training, &learned);
        }
        let evaluation = evaluate(&training, &learned.network, config.smoothing, &test)?;
        evaluation.print(data.class_names());
        accuracies.push(evaluation.accuracy());
    }

    println!();
    println!(
        "mean accuracy over {} folds: {:.2}% (standard deviation {:.2}%)",
        folds,
        accuracies.iter().mean() * 100.0,
        accuracies.iter().std_dev() * 100.0
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = SearchConfig {
        max_parents: args.max_parents,
        orderings: if args.fixed_order {
            Orderings::Fixed
        } else {
            Orderings::Random {
                trials: args.trials,
            }
        },
        smoothing: args.smoothing,
    };
    config.validate()?;

    let delimiter = u8::try_from(args.delimiter)
        .ok()
        .filter(u8::is_ascii)
        .context("the delimiter must be a single ASCII character")?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    // Class labels from every file share one interner, so class indices agree across files.
    let mut classes = Rodeo::new();
    let train = read_table(&args.train, delimiter, &mut classes)?;
    let test = match args.test {
        Some(ref path) => Some(read_table(path, delimiter, &mut classes)?),
        None => None,
    };
    let class_names: Vec<String> = (0..classes.len())
        .filter_map(Spur::try_from_usize)
        .map(|key| classes.resolve(&key).to_owned())
        .collect();

    let data = Dataset::new(train.header, class_names, train.rows)?;
    println!(
        "{} rows, {} attributes, {} classes",
        data.row_count(),
        data.attribute_count(),
        data.class_names().len()
    );

    if let Some(folds) = args.folds {
        return cross_validate(&data, &config, folds, &mut rng, args.verbose);
    }

    let learned = learn(&data, &config, &mut rng)?;
    print_network(&data, &learned);
    if args.verbose {
        let predictor = Predictor::new(&data, &learned.network, config.smoothing)?;
        print_tables(&data, &predictor)?;
    }

    if let Some(test) = test {
        if test.header.len() != data.variable_count() {
            bail!(
                "test data has {} columns but training data has {}",
                test.header.len(),
                data.variable_count()
            );
        }
        println!();
        evaluate(&data, &learned.network, config.smoothing, &test.rows)?.print(data.class_names());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(input: &str, classes: &mut Rodeo<Spur>) -> anyhow::Result<RawTable> {
        load_data(input.as_bytes(), b',', classes)
    }

    #[test]
    fn short_record_names_its_own_line() {
        let err = load("a,b,class\n1,2,x\n1,y\n3,4,z\n", &mut Rodeo::new())
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "line 3 has 2 fields but the header has 3");

        let err = load("a,b,class\n\n1,2,x\n\n1,2,3,y\n", &mut Rodeo::new())
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "line 5 has 4 fields but the header has 3");
    }

    #[test]
    fn empty_and_question_mark_fields_are_wildcards() {
        let table = load("a,b,c,class\n,?, 7 ,x\n", &mut Rodeo::new()).unwrap();
        assert_eq!(table.header, vec!["a", "b", "c", "class"]);
        assert_eq!(
            table.rows[0].values,
            vec![Value::Wildcard, Value::Wildcard, Value::Number(7.0)]
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        let table = load("\na,class\n\n1,x\n   \n\n2,y\n\n", &mut Rodeo::new()).unwrap();
        assert_eq!(table.header, vec!["a", "class"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].values, vec![Value::Number(2.0)]);
    }

    #[test]
    fn class_indices_are_shared_across_files() {
        let mut classes = Rodeo::new();
        let train = load("a,class\n1,spam\n2,ham\n", &mut classes).unwrap();
        let test = load("a,class\n3,ham\n4,eggs\n5,spam\n", &mut classes).unwrap();
        let train: Vec<usize> = train.rows.iter().map(|row| row.class).collect();
        let test: Vec<usize> = test.rows.iter().map(|row| row.class).collect();
        assert_eq!(train, vec![0, 1]);
        assert_eq!(test, vec![1, 2, 0]);
        assert_eq!(classes.len(), 3);
    }

    #[test]
    fn missing_header_is_an_error() {
        assert!(load("", &mut Rodeo::new()).is_err());
    }
}
