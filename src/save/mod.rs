mod trajectory;

pub use trajectory::TrajectoryWriter;
