use clap::{Arg, Command};
use std::io::{self, Write};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a synthetic sku,name,price CSV to stdout")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("no_header")
                .long("no-header")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("invalid_every")
                .long("invalid-every")
                .help("Make every Nth row fail validation (0 = never)")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(Arg::new("delim").long("delim").default_value(","))
        .get_matches();

    let rows: u64 = *matches.get_one("rows").unwrap();
    let with_header = !matches.get_flag("no_header");
    let invalid_every: u64 = *matches.get_one("invalid_every").unwrap();
    let delim = matches.get_one::<String>("delim").unwrap();

    let mut out = io::BufWriter::new(io::stdout().lock());

    if with_header {
        writeln!(&mut out, "sku{delim}name{delim}price")?;
    }

    // deterministic data; bad rows alternate between a negative and a missing price
    for i in 0..rows {
        let cents = (i * 7919) % 100_000 + 1;
        if invalid_every > 0 && (i + 1) % invalid_every == 0 {
            let price = if (i / invalid_every) % 2 == 0 { "-1" } else { "" };
            writeln!(&mut out, "SKU-{i:010}{delim}Product Name {i}{delim}{price}")?;
        } else {
            writeln!(
                &mut out,
                "SKU-{i:010}{delim}Product Name {i}{delim}{}.{:02}",
                cents / 100,
                cents % 100
            )?;
        }
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }

    out.flush()?;
    Ok(())
}
