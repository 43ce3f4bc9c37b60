use sledo_types::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("SLEDO types basic usage");

    // Descriptors as they arrive from an experiment file
    let descriptors: Vec<ParameterDescriptor> = serde_json::from_str(
        r#"[
            {"name": "armour_thickness", "kind": "uniform", "bounds": [1.0, 8.0]},
            {"name": "pipe_count", "kind": "integer", "bounds": [1, 6]},
            {"name": "material", "kind": "choice", "values": ["W", "CuCrZr"]}
        ]"#,
    )?;
    let space = SearchSpace::validate(&descriptors)?;
    println!("Search space has {} parameters", space.parameters.len());

    let mut parameters = ParameterSet::new();
    parameters.insert("armour_thickness".into(), ParameterValue::Float(3.5));
    parameters.insert("pipe_count".into(), ParameterValue::Int(2));
    parameters.insert("material".into(), ParameterValue::from_json("W".into()));
    println!(
        "Complete assignment: {}",
        space.is_complete_assignment(&parameters)
    );

    // Walk a trial through its lifecycle
    let mut trial = Trial::new(0, parameters);
    trial.mark_dispatched()?;
    trial.mark_succeeded(Metrics::from([("max_stress".to_string(), 412.0)]))?;
    println!(
        "Trial {} finished as {:?} with max_stress = {:?}",
        trial.id,
        trial.state,
        trial.metric("max_stress")
    );

    // Terminal trials cannot move again
    if let Err(e) = trial.mark_failed("late failure".into()) {
        println!("Rejected transition: {e}");
    }

    let mode = OptimisationMode::Maximise;
    println!(
        "412 in minimisation convention when maximising: {}",
        mode.to_minimisation(412.0)
    );

    Ok(())
}
