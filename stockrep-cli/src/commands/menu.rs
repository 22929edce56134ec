//! Interactive console.
//!
//! Reads one line per prompt. Errors from a menu action are reported and
//! the loop continues; only end of input or `x` leaves it.

use anyhow::Result;
use std::io::Write;
use stockrep_cluster::command::parse_price;
use stockrep_cluster::{ClusterError, ReplicaNode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

const MENU: &str = "[1] Show stocks [2] Get quote [3] Set quote [4] Remove quote [5] CAS [x] Exit";

/// A menu entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    ShowStocks,
    GetQuote,
    SetQuote,
    RemoveQuote,
    CompareAndSwap,
    Exit,
}

impl Choice {
    /// Parse a menu key; unknown keys are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "1" => Some(Self::ShowStocks),
            "2" => Some(Self::GetQuote),
            "3" => Some(Self::SetQuote),
            "4" => Some(Self::RemoveQuote),
            "5" => Some(Self::CompareAndSwap),
            "x" | "X" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Run the menu on stdin until exit, then leave the group.
pub async fn run(node: ReplicaNode) -> Result<()> {
    let mut console = Console::new(BufReader::new(tokio::io::stdin()), std::io::stdout());
    console.run(&node).await?;
    node.shutdown().await?;
    Ok(())
}

struct Console<R, W> {
    lines: tokio::io::Lines<R>,
    out: W,
}

impl<R: AsyncBufRead + Unpin, W: Write> Console<R, W> {
    fn new(reader: R, out: W) -> Self {
        Self {
            lines: reader.lines(),
            out,
        }
    }

    async fn run(&mut self, node: &ReplicaNode) -> Result<()> {
        loop {
            let Some(line) = self.prompt(MENU).await? else {
                return Ok(());
            };
            let Some(choice) = Choice::parse(&line) else {
                continue;
            };
            if choice == Choice::Exit {
                return Ok(());
            }

            match self.dispatch(node, choice).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) if e.is_input_error() => writeln!(self.out, "{}", e)?,
                Err(e) => {
                    tracing::debug!(error = %e, ?choice, "menu action failed");
                }
            }
        }
    }

    /// Returns `Ok(false)` when input ended mid-action.
    async fn dispatch(&mut self, node: &ReplicaNode, choice: Choice) -> Result<bool, ClusterError> {
        match choice {
            Choice::ShowStocks => {
                write!(self.out, "{}", format_stocks(&node.stocks()))?;
            }
            Choice::GetQuote => {
                let Some(symbol) = self.prompt("Symbol").await? else {
                    return Ok(false);
                };
                writeln!(self.out, "{}", format_quote(&symbol, node.get(&symbol)))?;
            }
            Choice::SetQuote => {
                let Some(symbol) = self.prompt("Symbol").await? else {
                    return Ok(false);
                };
                let Some(value) = self.prompt("Value").await? else {
                    return Ok(false);
                };
                let price = parse_price(&value)?;
                let responses = node.set(&symbol, price).await?;
                write!(self.out, "rsps:\n{}", responses)?;
            }
            Choice::RemoveQuote => {
                let Some(symbol) = self.prompt("Symbol").await? else {
                    return Ok(false);
                };
                let responses = node.remove(&symbol).await?;
                write!(self.out, "rsps:\n{}", responses)?;
            }
            Choice::CompareAndSwap => {
                let Some(symbol) = self.prompt("key").await? else {
                    return Ok(false);
                };
                let Some(reference) = self.prompt("referenceValue").await? else {
                    return Ok(false);
                };
                let Some(new_value) = self.prompt("newValue").await? else {
                    return Ok(false);
                };
                let outcome = node.compare_and_swap(&symbol, &reference, &new_value).await?;
                writeln!(self.out, "{}", outcome)?;
            }
            Choice::Exit => return Ok(false),
        }
        Ok(true)
    }

    async fn prompt(&mut self, label: &str) -> Result<Option<String>, ClusterError> {
        write!(self.out, "{}: ", label)?;
        self.out.flush()?;
        let line = self.lines.next_line().await?;
        Ok(line.map(|l| l.trim_end_matches('\r').to_string()))
    }
}

/// Render the local quotes, one per line.
pub fn format_stocks(stocks: &[(String, f64)]) -> String {
    let mut out = String::from("Stocks:\n");
    for (symbol, price) in stocks {
        out.push_str(&format!("{}: {}\n", symbol, price));
    }
    out
}

/// Render a single lookup.
pub fn format_quote(symbol: &str, price: Option<f64>) -> String {
    match price {
        Some(price) => format!("{} is {}", symbol, price),
        None => format!("{} is not quoted", symbol),
    }
}
