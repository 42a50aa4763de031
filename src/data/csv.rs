use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, Error as IoError, ErrorKind, Lines},
    path::{Path, PathBuf},
    rc::Rc,
};

use tracing::warn;

use crate::types::{
    BacktestError, BookTicker, Delivery, Event, Funding, Payload, Side, Symbol, Trade,
};

#[derive(Clone, Copy, Debug)]
enum Schema {
    BookTicker,
    Trade,
    Funding,
    Delivery,
}

impl Schema {
    fn header(&self) -> &'static str {
        match self {
            Schema::BookTicker => "timestamp,symbol,bid_price,bid_qty,ask_price,ask_qty",
            Schema::Trade => "timestamp,symbol,price,qty,side",
            Schema::Funding => "timestamp,symbol,funding_rate,mark_price",
            Schema::Delivery => "timestamp,symbol,price",
        }
    }
}

/// Reads one kind of market-data event from a headed CSV file.
///
/// Rows must be ordered by timestamp; the file is streamed through a buffered
/// reader, one event per row. Symbols are interned so every event for one
/// instrument shares a single allocation. A malformed row is logged and
/// skipped rather than aborting the run.
pub struct CsvDataset {
    lines: Lines<BufReader<File>>,
    schema: Schema,
    symbols: HashMap<String, Symbol>,
    path: PathBuf,
    line_no: u64,
}

impl CsvDataset {
    fn open<P: AsRef<Path>>(path: P, schema: Schema) -> Result<Self, BacktestError> {
        let path = path.as_ref().to_path_buf();
        let mut lines = BufReader::new(File::open(&path)?).lines();
        let header = lines
            .next()
            .transpose()?
            .ok_or_else(|| IoError::new(ErrorKind::UnexpectedEof, "empty csv file"))?;
        if header.trim_start_matches('\u{feff}').trim() != schema.header() {
            return Err(BacktestError::Data(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "unexpected csv header in {}: expected `{}`",
                    path.display(),
                    schema.header()
                ),
            )));
        }
        Ok(Self {
            lines,
            schema,
            symbols: HashMap::new(),
            path,
            line_no: 1,
        })
    }

    /// Opens a top-of-book snapshot file with the header
    /// `timestamp,symbol,bid_price,bid_qty,ask_price,ask_qty`.
    pub fn book_tickers<P: AsRef<Path>>(path: P) -> Result<Self, BacktestError> {
        Self::open(path, Schema::BookTicker)
    }

    /// Opens an aggregated trade file with the header
    /// `timestamp,symbol,price,qty,side`. The side column is the taker's side,
    /// `buy` or `sell`.
    pub fn trades<P: AsRef<Path>>(path: P) -> Result<Self, BacktestError> {
        Self::open(path, Schema::Trade)
    }

    /// Opens a funding file with the header
    /// `timestamp,symbol,funding_rate,mark_price`.
    pub fn funding<P: AsRef<Path>>(path: P) -> Result<Self, BacktestError> {
        Self::open(path, Schema::Funding)
    }

    /// Opens a delivery file with the header `timestamp,symbol,price`.
    pub fn deliveries<P: AsRef<Path>>(path: P) -> Result<Self, BacktestError> {
        Self::open(path, Schema::Delivery)
    }

    fn intern(&mut self, name: &str) -> Symbol {
        if let Some(symbol) = self.symbols.get(name) {
            return symbol.clone();
        }
        let symbol: Symbol = Rc::from(name);
        self.symbols.insert(name.to_string(), symbol.clone());
        symbol
    }

    fn parse(&mut self, line: &str) -> Option<Event> {
        let mut fields = line.split(',').map(str::trim);
        let timestamp: i64 = fields.next()?.parse().ok()?;
        let symbol = self.intern(fields.next()?);
        let payload = match self.schema {
            Schema::BookTicker => Payload::BookTicker(BookTicker {
                symbol,
                bid_price: fields.next()?.parse().ok()?,
                bid_qty: fields.next()?.parse().ok()?,
                ask_price: fields.next()?.parse().ok()?,
                ask_qty: fields.next()?.parse().ok()?,
            }),
            Schema::Trade => Payload::Trade(Trade {
                symbol,
                price: fields.next()?.parse().ok()?,
                qty: fields.next()?.parse().ok()?,
                side: match fields.next()? {
                    "buy" | "BUY" => Side::Buy,
                    "sell" | "SELL" => Side::Sell,
                    _ => return None,
                },
            }),
            Schema::Funding => Payload::Funding(Funding {
                symbol,
                funding_rate: fields.next()?.parse().ok()?,
                mark_price: fields.next()?.parse().ok()?,
            }),
            Schema::Delivery => Payload::Delivery(Delivery {
                symbol,
                price: fields.next()?.parse().ok()?,
            }),
        };
        if fields.next().is_some() {
            return None;
        }
        Some(Event::at(timestamp, payload))
    }
}

impl Iterator for CsvDataset {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "csv read failed");
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match self.parse(&line) {
                Some(event) => return Some(event),
                None => {
                    warn!(
                        path = %self.path.display(),
                        line = self.line_no,
                        "skipping malformed csv row"
                    );
                }
            }
        }
    }
}
