use crate::config::Config;
use crate::lattice::Lattice;
use color_eyre::eyre::{eyre, Result, WrapErr};
use nalgebra::Vector3;
use periodic_table_on_an_enum::Element;
use tracing::info;

/// Primitive-cell atoms (elements and coordinates in bohr) prepared from
/// the user configuration.
pub struct Geometry {
    pub elements: Vec<Element>,
    pub coords: Vec<Vector3<f64>>,
}

/// Build the primitive-cell geometry defined in the YAML configuration.
pub fn build_geometry(config: &Config) -> Result<Geometry> {
    info!("Preparing geometry...");

    let scale = config.length_scale();
    let mut elements = Vec::with_capacity(config.geometry.len());
    let mut coords = Vec::with_capacity(config.geometry.len());

    for atom in &config.geometry {
        let element = Element::from_symbol(&atom.element)
            .ok_or_else(|| eyre!("Invalid element symbol: {}", atom.element))?;
        let vector = Vector3::new(atom.coords[0], atom.coords[1], atom.coords[2]) * scale;
        elements.push(element);
        coords.push(vector);
    }

    if elements.is_empty() {
        return Err(eyre!("Geometry contains no atoms"));
    }
    Ok(Geometry { elements, coords })
}

/// Build the lattice from either the primitive or the supercell mesh.
pub fn build_lattice(config: &Config) -> Result<Lattice> {
    let cell = &config.cell;
    let scale = config.length_scale();
    let lengths = [
        cell.lengths[0] * scale,
        cell.lengths[1] * scale,
        cell.lengths[2] * scale,
    ];

    let lattice = match (cell.mesh, cell.supercell_mesh) {
        (Some(mesh), None) => Lattice::new(lengths, cell.kmesh, mesh),
        (None, Some(mesh)) => Lattice::from_supercell_mesh(lengths, cell.kmesh, mesh),
        _ => return Err(eyre!("Exactly one of cell.mesh and cell.supercell_mesh must be given")),
    }
    .wrap_err("Invalid cell description")?;

    info!(
        "Lattice: kmesh {:?}, primitive mesh {:?}, supercell volume {:.4} bohr^3",
        lattice.kmesh(),
        lattice.mesh_prim(),
        lattice.volume()
    );
    Ok(lattice)
}
