// Terminal prompts

use std::io::{self, BufRead, Write};

use systole::DiscoveredDevice;

/// Print `text` and read one line, without its line ending
pub fn prompt<R: BufRead, W: Write>(text: &str, input: &mut R, output: &mut W) -> io::Result<String> {
    write!(output, "{}", text)?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }

    Ok(line)
}

/// List `devices` and let the user pick one by number. `None` when the user
/// aborts or picks a number that is not listed.
pub fn choose_device<'a, R: BufRead, W: Write>(
    devices: &'a [DiscoveredDevice],
    input: &mut R,
    output: &mut W,
) -> io::Result<Option<&'a DiscoveredDevice>> {
    for (i, device) in devices.iter().enumerate() {
        writeln!(output, "{}) {}", i + 1, device)?;
    }

    let choice = prompt("Choose a device (number) or press Enter to cancel: ", input, output)?;
    let index = match choice.trim().parse::<usize>() {
        Ok(index) => index,
        Err(_) => {
            writeln!(output, "Cancelled")?;
            return Ok(None);
        }
    };

    match index.checked_sub(1).and_then(|i| devices.get(i)) {
        Some(device) => Ok(Some(device)),
        None => {
            writeln!(output, "Invalid choice")?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn devices() -> Vec<DiscoveredDevice> {
        vec![
            DiscoveredDevice {
                address: "A4:C1:38:A5:20:BB".to_string(),
                name: Some("BM64".to_string()),
            },
            DiscoveredDevice {
                address: "11:22:33:44:55:66".to_string(),
                name: None,
            },
        ]
    }

    #[test]
    fn picks_by_number() {
        let devices = devices();
        let mut output = Vec::new();

        let chosen = choose_device(&devices, &mut "2\r\n".as_bytes(), &mut output).unwrap();

        assert_eq!(chosen.map(|d| d.address.as_str()), Some("11:22:33:44:55:66"));
        let listing = String::from_utf8(output).unwrap();
        assert!(listing.starts_with("1) BM64 [A4:C1:38:A5:20:BB]\n2) Unknown [11:22:33:44:55:66]\n"));
    }

    #[test]
    fn empty_input_cancels() {
        let devices = devices();
        let mut output = Vec::new();

        assert_eq!(choose_device(&devices, &mut "\n".as_bytes(), &mut output).unwrap(), None);
    }

    #[test]
    fn out_of_range() {
        let devices = devices();
        let mut output = Vec::new();

        assert_eq!(choose_device(&devices, &mut "0\n".as_bytes(), &mut output).unwrap(), None);
        assert_eq!(choose_device(&devices, &mut "3\n".as_bytes(), &mut output).unwrap(), None);
        assert!(String::from_utf8(output).unwrap().contains("Invalid choice"));
    }
}
