use crate::common_io::{read_numeric_rows, write_lines};
use crate::traits::IoOps;
use ndarray::prelude::*;
use std::fmt::Display;
use std::str::FromStr;

impl<T> IoOps for Array2<T>
where
    T: FromStr + Send + Display + Clone,
    <T as FromStr>::Err: Display,
{
    type Scalar = T;
    type Mat = Self;

    fn read_file_delim(file: &str, delim: Option<&str>, skip: usize) -> anyhow::Result<Self::Mat> {
        let rows = read_numeric_rows::<T>(file, delim, skip)?;

        if rows.is_empty() {
            return Err(anyhow::anyhow!("No data in file {}", file));
        }

        let nrows = rows.len();
        let ncols = rows[0].len();
        let data = rows.into_iter().flatten().collect::<Vec<_>>();
        Ok(Array2::from_shape_vec((nrows, ncols), data)?)
    }

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        let lines: Vec<Box<str>> = self
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", x))
                    .collect::<Vec<String>>()
                    .join("\t")
                    .into_boxed_str()
            })
            .collect();
        write_lines(&lines, tsv_file)
    }
}
