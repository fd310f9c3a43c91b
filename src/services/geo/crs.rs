use super::{Extent, GeoError};
use proj4rs::Proj;

/// Geographic WGS 84, the canonical CRS for stored extents
pub const WGS84: u16 = 4326;

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Text(String),
    Number(String),
    Open,
    Close,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.')
}

/// Splits WKT1 or WKT2 into tokens. Commas carry no information here and are dropped.
fn tokenize(wkt: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = wkt.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '[' | '(' => tokens.push(Token::Open),
            ']' | ')' => tokens.push(Token::Close),
            ',' => {}
            '"' => {
                let mut text = String::new();
                loop {
                    match chars.next()? {
                        // Doubled quote is an escaped quote
                        '"' if chars.peek() == Some(&'"') => {
                            chars.next();
                            text.push('"');
                        }
                        '"' => break,
                        c => text.push(c),
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_whitespace() => {}
            c if is_word_char(c) => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek().filter(|n| is_word_char(**n)) {
                    word.push(next);
                    chars.next();
                }
                tokens.push(if c.is_ascii_alphabetic() || c == '_' {
                    Token::Word(word)
                } else {
                    Token::Number(word)
                });
            }
            _ => return None,
        }
    }
    Some(tokens)
}

/// Name and EPSG code of the outermost CRS node.
///
/// Only AUTHORITY (WKT1) or ID (WKT2) children of the root count, nested ones
/// identify datums, units and the like.
fn root_identity(wkt: &str) -> Option<(Option<String>, Option<u16>)> {
    let tokens = tokenize(wkt)?;
    let [Token::Word(_), Token::Open, rest @ ..] = tokens.as_slice() else {
        return None;
    };

    let name = match rest.first() {
        Some(Token::Text(name)) => Some(name.clone()),
        _ => None,
    };

    let mut depth = 1;
    let mut code = None;
    for (i, token) in rest.iter().enumerate() {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth -= 1;
                if depth == 0 {
                    return Some((name, code));
                }
            }
            Token::Word(keyword)
                if depth == 1
                    && (keyword.eq_ignore_ascii_case("AUTHORITY")
                        || keyword.eq_ignore_ascii_case("ID")) =>
            {
                if let [Token::Open, Token::Text(auth), Token::Text(c) | Token::Number(c), ..] =
                    &rest[i + 1..]
                {
                    if auth.eq_ignore_ascii_case("EPSG") {
                        code = c.trim().parse().ok().or(code);
                    }
                }
            }
            _ => {}
        }
    }

    // Root node never closed
    None
}

fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Well-known ESRI and OGC names that commonly appear without an authority code
fn code_for_name(name: &str) -> Option<u16> {
    let name = normalize_name(name);

    let fixed = match name.as_str() {
        "gcs_wgs_1984" | "wgs_84" | "wgs84" | "wgs_1984" => Some(4326),
        "wgs_1984_web_mercator_auxiliary_sphere"
        | "wgs_1984_web_mercator"
        | "wgs_84_pseudo_mercator"
        | "popular_visualisation_crs_mercator" => Some(3857),
        "gcs_north_american_1983" | "nad83" => Some(4269),
        "gcs_north_american_1927" | "nad27" => Some(4267),
        "gcs_etrs_1989" | "etrs89" => Some(4258),
        "gcs_osgb_1936" | "osgb_1936" | "osgb36" => Some(4277),
        "british_national_grid" | "osgb_1936_british_national_grid" | "osgb36_british_national_grid" => {
            Some(27700)
        }
        "etrs_1989_laea" | "etrs89_etrs_laea" | "etrs89_lambert_azimuthal_equal_area" => {
            Some(3035)
        }
        _ => None,
    };
    fixed.or_else(|| utm_code(&name))
}

fn utm_code(name: &str) -> Option<u16> {
    let (datum, zone) = name.split_once("_utm_zone_")?;
    let digits: String = zone.chars().take_while(|c| c.is_ascii_digit()).collect();
    let number: u16 = digits.parse().ok()?;
    if !(1..=60).contains(&number) {
        return None;
    }
    let hemisphere = zone[digits.len()..].chars().next().unwrap_or('n');

    match (datum, hemisphere) {
        ("wgs_1984" | "wgs_84", 'n') => Some(32600 + number),
        ("wgs_1984" | "wgs_84", 's') => Some(32700 + number),
        ("nad_1983" | "nad83", 'n') if (1..=23).contains(&number) => Some(26900 + number),
        ("etrs_1989" | "etrs89", 'n') if (28..=38).contains(&number) => Some(25800 + number),
        _ => None,
    }
}

/// Resolves the EPSG code of a CRS definition in WKT1 (including ESRI `.prj`) or WKT2.
pub fn epsg_from_wkt(wkt: &str) -> Option<u16> {
    let (name, code) = root_identity(wkt)?;
    code.or_else(|| name.as_deref().and_then(code_for_name))
}

fn proj_for(code: u16) -> Result<Proj, GeoError> {
    let def = crs_definitions::from_code(code)
        .ok_or_else(|| GeoError::UnrecognisedCrs(format!("EPSG:{}", code)))?;
    // proj4rs does not know the `+type=crs` marker
    let definition: Vec<&str> = def
        .proj4
        .split_whitespace()
        .filter(|t| !t.starts_with("+type="))
        .collect();
    Proj::from_proj_string(&definition.join(" "))
        .map_err(|e| GeoError::Reprojection(format!("EPSG:{}: {}", code, e)))
}

/// Reprojects the four corners of `bbox` from `source` into EPSG:4326 and
/// returns their bounding box.
pub fn reproject_to_wgs84(source: u16, bbox: Extent) -> Result<Extent, GeoError> {
    if source == WGS84 {
        return Ok(bbox);
    }

    let src = proj_for(source)?;
    let dst = proj_for(WGS84)?;

    let corners = [
        (bbox.min_x, bbox.min_y),
        (bbox.min_x, bbox.max_y),
        (bbox.max_x, bbox.min_y),
        (bbox.max_x, bbox.max_y),
    ];

    let mut out: Option<Extent> = None;
    for (x, y) in corners {
        let mut point = if src.is_latlong() {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        proj4rs::transform::transform(&src, &dst, &mut point)
            .map_err(|e| GeoError::Reprojection(format!("EPSG:{} -> EPSG:4326: {}", source, e)))?;

        let (lon, lat) = (point.0.to_degrees(), point.1.to_degrees());
        if !lon.is_finite() || !lat.is_finite() {
            return Err(GeoError::Reprojection(format!(
                "EPSG:{} corner ({}, {}) has no geographic equivalent",
                source, x, y
            )));
        }

        let corner = Extent::new(lon, lat, lon, lat);
        out = Some(out.map_or(corner, |e| e.union(corner)));
    }

    out.ok_or_else(|| GeoError::Reprojection("empty bounding box".to_string()))
}
