use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use std::collections::BTreeMap;
use strata_common::{ColumnSlice, DecodeError, COLUMN_COUNT};

/// Unpadded standard alphabet. The client does not zero the spare low bits
/// of the final character, so those are ignored.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

const LITERAL_LEN: usize = 6;

/// Decodes a `getchunkdata` payload into 256 pixels and heights.
///
/// The payload is a comma separated list. Each element is a 6-character
/// base64 literal (a little-endian `u32`) or the decimal index of an earlier
/// output position, optionally followed by `*N` to emit the value N more
/// times. The high byte of each value is the column height.
pub fn decode(data: &str) -> Result<ColumnSlice, DecodeError> {
    let payload = data.trim().trim_matches('"').trim();
    if payload.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    let mut values: Vec<u32> = Vec::with_capacity(COLUMN_COUNT);

    for element in payload.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (token, repeat) = split_repeat(element)?;

        let value = if token.len() == LITERAL_LEN {
            decode_literal(token)?
        } else {
            let index: usize = token.parse().map_err(|_| DecodeError::InvalidToken {
                token: token.to_owned(),
                position: values.len(),
            })?;
            *values.get(index).ok_or(DecodeError::UnknownReference {
                index,
                position: values.len(),
            })?
        };

        let needed = values.len() + repeat + 1;
        if needed > COLUMN_COUNT {
            return Err(DecodeError::WrongLength { len: needed });
        }
        values.extend(std::iter::repeat(value).take(repeat + 1));
    }

    if values.len() != COLUMN_COUNT {
        return Err(DecodeError::WrongLength { len: values.len() });
    }

    let mut pixels = [0u32; COLUMN_COUNT];
    let mut heights = [0u8; COLUMN_COUNT];
    for (i, value) in values.into_iter().enumerate() {
        heights[i] = (value >> 24) as u8;
        pixels[i] = (value & 0x00FF_FFFF) | 0xFF00_0000;
    }
    Ok(ColumnSlice::from_arrays(pixels, heights))
}

fn split_repeat(element: &str) -> Result<(&str, usize), DecodeError> {
    let mut parts = element.split('*');
    let token = parts.next().unwrap_or_default();
    let repeat = match parts.next() {
        None => 0,
        Some(count) => count.trim().parse::<usize>().map_err(|_| DecodeError::InvalidRepeat {
            token: element.to_owned(),
        })?,
    };
    if parts.next().is_some() {
        return Err(DecodeError::InvalidRepeat {
            token: element.to_owned(),
        });
    }
    Ok((token, repeat))
}

fn decode_literal(token: &str) -> Result<u32, DecodeError> {
    let invalid = || DecodeError::InvalidBase64 {
        token: token.to_owned(),
    };
    let raw = TOKEN_ENGINE.decode(token).map_err(|_| invalid())?;
    let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| invalid())?;
    Ok(u32::from_le_bytes(bytes))
}

/// Decodes several Y slices of the same chunk column, keyed by Y offset.
pub fn assemble_slices(
    payloads: &[&str],
    y_offsets: &[i32],
) -> Result<BTreeMap<i32, ColumnSlice>, DecodeError> {
    if payloads.len() != y_offsets.len() {
        return Err(DecodeError::WrongLength {
            len: payloads.len().max(y_offsets.len()),
        });
    }
    payloads
        .iter()
        .zip(y_offsets)
        .map(|(payload, &y)| decode(payload).map(|slice| (y, slice)))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    pub(crate) const SAMPLE: &str = "\"TaRoRg*2,LEFYRg*2,P4ZVRQ,TaRoRQ,3,M0xmRg,3,TaRoRA,JDVIRQ,LEFYRQ,P4ZVRA,13,0*1,7,RYVXRQ,VKNqRQ,3,7,20,3*1,13*1,11,14,11,14,6,RYVXPQ,RYVXQA,RYVXQw,3*1,20*1,19,13,jMnVRg,13,11,M0xmRQ,11*1,9,W6FsPQ,VKNqPw,RYVXQg,3,19,20*1,13*3,11,14,11,AGoARQ,3,49,50,VKNqQQ,42,9,13*5,VKNqRA*3,3,8k4NPQ,W6FsPw,67,JDVIRA,12,W6FsRA,13*2,IHQ6Rg,13,45,13,Yr17RQ,76,W6FsRg,art+RQ,S4RZPg,W6FsQA,51,GV4vRg*2,13,90,PmZ7Rg,90,13*1,RYVXRA,86,W6FsRQ*1,W6FsPg,99,HV0wRg,GVAqRg,FlEpRg*1,116,S4RZRQ,H2MzRg,12,13,S4RZRA,86,S4RZQw,125,13,114,82,117*1,106,118,117,86,12,13,112,86,127,W6FsQw,45,125,45*1,117,HFAqRg*2,117,13,86,149,IFwxRg,JFwyRg,143,LEFYRA,Yp9vRQ,45,106,13,12,149,H08rRg*2,86,157,166*2,157,S4RZQg,9,160,3,13*1,12,13,12,13,86,Ik4sRg*1,106,166*1,W6FsQg,3,160,UIJaRQ,13*1,86,125,86,125,143,186*4,191,3*1,160*1,112,86*4,84,186*1,JU4tRg,JDVIQw,191,194,160*3,97,86,Yp9vRA*3,UIJaQw*1,84,UIJaQg,M0xmQw,160*5,crmARQ,231*3,Yp9vQw*1,235,Yp9vQg,238\"";

    #[test]
    fn test_decode_sample() {
        let slice = decode(SAMPLE).unwrap();
        assert_eq!(slice.pixels().len(), 256);
        assert_eq!(slice.heights().len(), 256);
        assert!(slice.pixels().iter().all(|p| p >> 24 == 0xFF));
    }

    #[test]
    fn test_decode_literal_layout() {
        // "TaRoRg" -> bytes 4d a4 68 46 -> 0x4668a44d
        let slice = decode(SAMPLE).unwrap();
        assert_eq!(slice.heights()[0], 0x46);
        assert_eq!(slice.pixels()[0], 0xFF68_A44D);
        // "TaRoRg*2" fills positions 0..=2
        assert_eq!(slice.pixels()[2], slice.pixels()[0]);
        // "3" references the "LEFYRg" literal at position 3
        assert_eq!(slice.pixels()[8], slice.pixels()[3]);
    }

    #[test]
    fn test_decode_rejects_invalid_literal() {
        assert!(decode("XXXXXX").is_err());
        assert_matches!(decode("!!!!!!"), Err(DecodeError::InvalidBase64 { .. }));
    }

    #[test]
    fn test_decode_rejects_forward_reference() {
        assert_matches!(
            decode("5"),
            Err(DecodeError::UnknownReference { index: 5, position: 0 })
        );
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert_matches!(decode("  \"\" "), Err(DecodeError::EmptyPayload));
        assert_matches!(decode(""), Err(DecodeError::EmptyPayload));
    }

    #[test]
    fn test_decode_rejects_bad_repeat() {
        assert_matches!(decode("TaRoRg*x"), Err(DecodeError::InvalidRepeat { .. }));
        assert_matches!(decode("TaRoRg*-1"), Err(DecodeError::InvalidRepeat { .. }));
        assert_matches!(decode("TaRoRg*1*2"), Err(DecodeError::InvalidRepeat { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage_token() {
        assert_matches!(
            decode("TaRoRg,abc"),
            Err(DecodeError::InvalidToken { position: 1, .. })
        );
    }

    #[test]
    fn test_decode_length_checks() {
        assert_matches!(decode("TaRoRg*254"), Err(DecodeError::WrongLength { len: 255 }));
        assert!(decode("TaRoRg*255").is_ok());
        assert_matches!(
            decode("TaRoRg*255,0"),
            Err(DecodeError::WrongLength { len: 257 })
        );
        assert_matches!(decode("TaRoRg*1000"), Err(DecodeError::WrongLength { len: 1001 }));
    }

    #[test]
    fn test_decode_skips_empty_elements() {
        let slice = decode("TaRoRg*100,,0*154, ,").unwrap();
        assert!(slice.heights().iter().all(|&h| h == 0x46));
    }

    #[test]
    fn test_assemble_slices() {
        let slices = assemble_slices(&[SAMPLE, "TaRoRg*255"], &[20, 10]).unwrap();
        assert_eq!(slices.keys().copied().collect::<Vec<_>>(), vec![10, 20]);

        assert_matches!(
            assemble_slices(&[SAMPLE], &[1, 2]),
            Err(DecodeError::WrongLength { len: 2 })
        );
    }
}
