use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Read a Kaldi-style two-column list (`feats.scp`, `utt2spk`, ...).
///
/// The first whitespace-separated token of each non-empty line is the key and
/// the trimmed remainder is the value, which may itself contain spaces.
pub fn read_scp<P: AsRef<Path>>(path: P) -> io::Result<Vec<(String, String)>> {
    let content = fs::read_to_string(path.as_ref())?;
    Ok(parse_scp(&content))
}

pub fn parse_scp(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key.to_string(), value.trim().to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

/// Assign dense ids to speakers in sorted name order.
pub fn spk2id(utt2spk: &[(String, String)]) -> BTreeMap<String, u32> {
    let mut speakers: Vec<&str> = utt2spk.iter().map(|(_, spk)| spk.as_str()).collect();
    speakers.sort_unstable();
    speakers.dedup();
    speakers
        .into_iter()
        .enumerate()
        .map(|(id, spk)| (spk.to_string(), id as u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_blank_lines_and_keeps_value_spaces() {
        let list = parse_scp("utt1 /data/a.ark:12\n\n  utt2   sox a.wav -t wav - |  \nlonely\n");
        assert_eq!(
            list,
            vec![
                ("utt1".to_string(), "/data/a.ark:12".to_string()),
                ("utt2".to_string(), "sox a.wav -t wav - |".to_string()),
                ("lonely".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_spk2id_is_sorted_and_dense() {
        let utt2spk = parse_scp("u1 spkB\nu2 spkA\nu3 spkB\nu4 spkC\n");
        let ids = spk2id(&utt2spk);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids["spkA"], 0);
        assert_eq!(ids["spkB"], 1);
        assert_eq!(ids["spkC"], 2);
    }

    #[test]
    fn test_read_scp_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utt2spk");
        std::fs::write(&path, "u1 s1\nu2 s2\n").unwrap();
        assert_eq!(read_scp(&path).unwrap().len(), 2);
        assert!(read_scp(dir.path().join("missing")).is_err());
    }
}
