use matrix_util::common_io::{create_temp_dir_file, remove_file, write_lines};
use matrix_util::traits::{IoOps, SampleOps};

#[test]
fn ndarray_io_test() -> anyhow::Result<()> {
    let xx = ndarray::Array2::<f32>::runif(50, 20, 3)?;

    let tsv_file = create_temp_dir_file("txt.gz")?;
    let tsv_name = tsv_file.to_str().unwrap();
    xx.to_tsv(tsv_name)?;

    let yy = ndarray::Array2::<f32>::from_tsv(tsv_name, 0)?;
    assert_eq!(xx, yy);

    remove_file(&tsv_file)?;
    Ok(())
}

#[test]
fn whitespace_with_header_and_comments() -> anyhow::Result<()> {
    let file = create_temp_dir_file("txt")?;
    let name = file.to_str().unwrap();
    let lines: Vec<Box<str>> = ["a b c", "# comment", "1 2 3", "4  5 6"]
        .iter()
        .map(|s| s.to_string().into_boxed_str())
        .collect();
    write_lines(&lines, name)?;

    let yy = ndarray::Array2::<f64>::read_file_delim(name, None, 1)?;
    assert_eq!(yy, ndarray::array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);

    remove_file(&file)?;
    Ok(())
}

#[test]
fn ragged_rows_are_rejected() -> anyhow::Result<()> {
    let file = create_temp_dir_file("tsv")?;
    let name = file.to_str().unwrap();
    let lines: Vec<Box<str>> = ["1\t2", "3"]
        .iter()
        .map(|s| s.to_string().into_boxed_str())
        .collect();
    write_lines(&lines, name)?;

    assert!(ndarray::Array2::<f64>::from_tsv(name, 0).is_err());
    remove_file(&file)?;
    Ok(())
}
