//! ESRI WKT for `.prj` sidecar files.

use geoharvest_feature_models::Crs;

const DEGREE: &str = r#"PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]"#;

fn sirgas_2000() -> String {
    format!(
        r#"GEOGCS["GCS_SIRGAS_2000",DATUM["D_SIRGAS_2000",SPHEROID["GRS_1980",6378137.0,298.257222101]],{DEGREE}]"#
    )
}

fn wgs_84() -> String {
    format!(
        r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],{DEGREE}]"#
    )
}

fn sad_69() -> String {
    format!(
        r#"GEOGCS["GCS_South_American_1969",DATUM["D_South_American_1969",SPHEROID["GRS_1967_Truncated",6378160.0,298.25]],{DEGREE}]"#
    )
}

fn utm(name: &str, geogcs: &str, zone: u32, south: bool) -> String {
    let hemisphere = if south { 'S' } else { 'N' };
    let false_northing = if south { 10_000_000.0 } else { 0.0 };
    let central_meridian = f64::from(zone).mul_add(6.0, -183.0);
    format!(
        r#"PROJCS["{name}_UTM_Zone_{zone}{hemisphere}",{geogcs},PROJECTION["Transverse_Mercator"],PARAMETER["False_Easting",500000.0],PARAMETER["False_Northing",{false_northing:.1}],PARAMETER["Central_Meridian",{central_meridian:.1}],PARAMETER["Scale_Factor",0.9996],PARAMETER["Latitude_Of_Origin",0.0],UNIT["Meter",1.0]]"#
    )
}

/// Returns the `.prj` text for a CRS, or `None` when it is not one of the
/// systems the harvested layers use.
#[must_use]
pub fn wkt(crs: Crs) -> Option<String> {
    let code = crs.code();
    Some(match code {
        4674 => sirgas_2000(),
        4326 => wgs_84(),
        4618 => sad_69(),
        3857 => format!(
            r#"PROJCS["WGS_1984_Web_Mercator_Auxiliary_Sphere",{},PROJECTION["Mercator_Auxiliary_Sphere"],PARAMETER["False_Easting",0.0],PARAMETER["False_Northing",0.0],PARAMETER["Central_Meridian",0.0],PARAMETER["Standard_Parallel_1",0.0],PARAMETER["Auxiliary_Sphere_Type",0.0],UNIT["Meter",1.0]]"#,
            wgs_84()
        ),
        31972..=31977 => utm("SIRGAS_2000", &sirgas_2000(), code - 31972 + 17, false),
        31978..=31985 => utm("SIRGAS_2000", &sirgas_2000(), code - 31978 + 18, true),
        32601..=32660 => utm("WGS_1984", &wgs_84(), code - 32600, false),
        32701..=32760 => utm("WGS_1984", &wgs_84(), code - 32700, true),
        _ => return None,
    })
}
